//! Composition root
//!
//! Builds the whole core in declared dependency order: config, session
//! provider and identity feed, namespaced stores, sync engines, preferences,
//! reconciler, bridge. No component reaches for a global; everything is
//! injected here. The runtime also owns the identity watcher that delivers
//! namespace switches to every store before any engine may pull for the new
//! identity.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bridge::{CrossProcessBridge, SharedSlotStorage};
use crate::config::CoreConfig;
use crate::domain::{DomainSnapshotProvider, HabitCollection, StatsSettings, UserProfile};
use crate::error::{CoreError, Result};
use crate::preferences::{NotificationPreferences, PreferencesStore};
use crate::reconcile::{NotificationReconciler, NotificationScheduler};
use crate::replica::{KeyValueStore, ReplicaStore};
use crate::session::{IdentitySnapshot, SessionProvider};
use crate::sync::{RemoteResourceClient, SyncEngine};

/// Builder for [`CoreRuntime`]. Collaborators are injected; nothing is
/// resolved from ambient state.
#[derive(Default)]
pub struct CoreRuntimeBuilder {
    config: Option<CoreConfig>,
    kv: Option<Arc<dyn KeyValueStore>>,
    scheduler: Option<Arc<dyn NotificationScheduler>>,
    domain: Option<Arc<dyn DomainSnapshotProvider>>,
    profile_client: Option<Arc<dyn RemoteResourceClient<UserProfile>>>,
    habits_client: Option<Arc<dyn RemoteResourceClient<HabitCollection>>>,
    stats_client: Option<Arc<dyn RemoteResourceClient<StatsSettings>>>,
    preferences_client: Option<Arc<dyn RemoteResourceClient<NotificationPreferences>>>,
    bridge_storage: Option<Arc<dyn SharedSlotStorage>>,
}

impl CoreRuntimeBuilder {
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn key_value_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn NotificationScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn domain_provider(mut self, domain: Arc<dyn DomainSnapshotProvider>) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn profile_client(mut self, client: Arc<dyn RemoteResourceClient<UserProfile>>) -> Self {
        self.profile_client = Some(client);
        self
    }

    pub fn habits_client(mut self, client: Arc<dyn RemoteResourceClient<HabitCollection>>) -> Self {
        self.habits_client = Some(client);
        self
    }

    pub fn stats_client(mut self, client: Arc<dyn RemoteResourceClient<StatsSettings>>) -> Self {
        self.stats_client = Some(client);
        self
    }

    pub fn preferences_client(
        mut self,
        client: Arc<dyn RemoteResourceClient<NotificationPreferences>>,
    ) -> Self {
        self.preferences_client = Some(client);
        self
    }

    /// Optional: without bridge storage the runtime has no cross-process
    /// mailbox.
    pub fn bridge_storage(mut self, storage: Arc<dyn SharedSlotStorage>) -> Self {
        self.bridge_storage = Some(storage);
        self
    }

    /// Construct everything in dependency order. Must run inside a tokio
    /// runtime; the sync engines spawn their debounce loops immediately.
    pub async fn build(self) -> Result<CoreRuntime> {
        let config = self.config.unwrap_or_default();
        let kv = self.kv.ok_or_else(|| missing("key_value_store"))?;
        let scheduler = self.scheduler.ok_or_else(|| missing("scheduler"))?;
        let domain = self.domain.ok_or_else(|| missing("domain_provider"))?;
        let profile_client = self.profile_client.ok_or_else(|| missing("profile_client"))?;
        let habits_client = self.habits_client.ok_or_else(|| missing("habits_client"))?;
        let stats_client = self.stats_client.ok_or_else(|| missing("stats_client"))?;
        let preferences_client = self
            .preferences_client
            .ok_or_else(|| missing("preferences_client"))?;

        let session = Arc::new(SessionProvider::new());
        let initial = session.feed().current();

        // Stores load their initial namespace before anything can read them.
        let profile = ReplicaStore::<UserProfile>::new(
            "profile",
            kv.clone(),
            &initial,
            config.guest_namespace.clone(),
        )
        .await?;
        let habits = ReplicaStore::<HabitCollection>::new(
            "habits",
            kv.clone(),
            &initial,
            config.guest_namespace.clone(),
        )
        .await?;
        let stats = ReplicaStore::<StatsSettings>::new(
            "stats_settings",
            kv.clone(),
            &initial,
            config.guest_namespace.clone(),
        )
        .await?;
        let preferences = PreferencesStore::new(kv, &initial, &config).await?;

        let reconciler = Arc::new(NotificationReconciler::new(
            scheduler,
            preferences.watch(),
            domain,
        ));
        preferences.attach_reconciler(reconciler.clone());

        let profile_engine =
            SyncEngine::new(session.clone(), profile_client, profile.clone(), &config);
        let habits_engine =
            SyncEngine::new(session.clone(), habits_client, habits.clone(), &config);
        let stats_engine = SyncEngine::new(session.clone(), stats_client, stats.clone(), &config);
        let preferences_engine = SyncEngine::new(
            session.clone(),
            preferences_client,
            preferences.clone(),
            &config,
        );

        let bridge = self
            .bridge_storage
            .map(|storage| Arc::new(CrossProcessBridge::new(storage)));

        Ok(CoreRuntime {
            inner: Arc::new(RuntimeInner {
                session,
                profile,
                habits,
                stats,
                preferences,
                reconciler,
                profile_engine,
                habits_engine,
                stats_engine,
                preferences_engine,
                bridge,
            }),
        })
    }
}

fn missing(field: &str) -> CoreError {
    CoreError::ConfigurationError {
        config_path: "CoreRuntimeBuilder".to_string(),
        field: field.to_string(),
        cause: "required collaborator not provided".into(),
    }
}

struct RuntimeInner {
    session: Arc<SessionProvider>,
    profile: Arc<ReplicaStore<UserProfile>>,
    habits: Arc<ReplicaStore<HabitCollection>>,
    stats: Arc<ReplicaStore<StatsSettings>>,
    preferences: Arc<PreferencesStore>,
    reconciler: Arc<NotificationReconciler>,
    profile_engine: Arc<SyncEngine<UserProfile>>,
    habits_engine: Arc<SyncEngine<HabitCollection>>,
    stats_engine: Arc<SyncEngine<StatsSettings>>,
    preferences_engine: Arc<SyncEngine<NotificationPreferences>>,
    bridge: Option<Arc<CrossProcessBridge>>,
}

impl RuntimeInner {
    /// Deliver a namespace switch to every store, siblings first so the
    /// preferences store's settle-delayed reconcile sees them switched, then
    /// let the engines pull for the new identity.
    async fn handle_identity_change(&self, snapshot: &IdentitySnapshot) {
        if let Err(e) = self.profile.apply_namespace_change(snapshot).await {
            warn!(error = %e, "profile namespace switch failed");
        }
        if let Err(e) = self.habits.apply_namespace_change(snapshot).await {
            warn!(error = %e, "habits namespace switch failed");
        }
        if let Err(e) = self.stats.apply_namespace_change(snapshot).await {
            warn!(error = %e, "stats namespace switch failed");
        }
        if let Err(e) = self.preferences.apply_namespace_change(snapshot).await {
            warn!(error = %e, "preferences namespace switch failed");
        }

        self.activate_engines().await;
    }

    async fn activate_engines(&self) {
        self.profile_engine.activate().await;
        self.habits_engine.activate().await;
        self.stats_engine.activate().await;
        self.preferences_engine.activate().await;
    }
}

/// The assembled core. Cheap to clone handles out of; owns the identity
/// watcher task once launched.
pub struct CoreRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for CoreRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntime").finish_non_exhaustive()
    }
}

impl CoreRuntime {
    pub fn builder() -> CoreRuntimeBuilder {
        CoreRuntimeBuilder::default()
    }

    /// Start the core: nuclear notification cleanup (nothing from a prior
    /// run or account may survive), engine change-consumers, the identity
    /// watcher, then an initial reconcile and pull for the current identity.
    pub async fn launch(&self) {
        info!("launching sync core");
        if let Err(e) = self.inner.reconciler.cancel_all().await {
            warn!(error = %e, "launch cleanup failed");
        }

        self.inner.profile_engine.start();
        self.inner.habits_engine.start();
        self.inner.stats_engine.start();
        self.inner.preferences_engine.start();

        let inner = self.inner.clone();
        let mut feed = self.inner.session.feed().subscribe();
        tokio::spawn(async move {
            while feed.changed().await.is_ok() {
                let snapshot = feed.borrow_and_update().clone();
                inner.handle_identity_change(&snapshot).await;
            }
        });

        if let Err(e) = self.inner.reconciler.reconcile_all("launch").await {
            warn!(error = %e, "launch reconcile failed");
        }
        self.inner.activate_engines().await;
    }

    pub fn session(&self) -> &Arc<SessionProvider> {
        &self.inner.session
    }

    pub fn profile(&self) -> &Arc<ReplicaStore<UserProfile>> {
        &self.inner.profile
    }

    pub fn habits(&self) -> &Arc<ReplicaStore<HabitCollection>> {
        &self.inner.habits
    }

    pub fn stats(&self) -> &Arc<ReplicaStore<StatsSettings>> {
        &self.inner.stats
    }

    pub fn preferences(&self) -> &Arc<PreferencesStore> {
        &self.inner.preferences
    }

    pub fn reconciler(&self) -> &Arc<NotificationReconciler> {
        &self.inner.reconciler
    }

    pub fn bridge(&self) -> Option<&Arc<CrossProcessBridge>> {
        self.inner.bridge.as_ref()
    }
}
