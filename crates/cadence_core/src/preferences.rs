//! Notification preferences and their namespaced store
//!
//! `PreferencesStore` is the one replica whose writes drive side effects:
//! every real change triggers a reconciliation pass, and a namespace switch
//! cancels the outgoing identity's notifications before the swap so nothing
//! is ever visible to the wrong account, even transiently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::NaiveTime;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::error::Result;
use crate::reconcile::NotificationReconciler;
use crate::replica::{KeyValueStore, Namespace, ReplicaStore};
use crate::session::IdentitySnapshot;
use crate::sync::SyncTarget;

/// Resource key for the preferences replica.
pub const PREFERENCES_RESOURCE: &str = "notification_preferences";

/// Versioned notification preference set: a master switch, per-feature
/// switches, and per-feature times of day. Equality-comparable; a write that
/// does not change the value triggers nothing downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreferences {
    pub version: u32,
    pub master_enabled: bool,

    pub daily_reminder_enabled: bool,
    pub daily_reminder_time: NaiveTime,

    pub daily_recap_enabled: bool,
    pub daily_recap_time: NaiveTime,

    pub task_reminders_enabled: bool,

    pub streak_risk_enabled: bool,
    pub goal_progress_enabled: bool,
    pub inactivity_enabled: bool,
    pub achievement_enabled: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            version: 1,
            master_enabled: false,
            daily_reminder_enabled: false,
            daily_reminder_time: NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
            daily_recap_enabled: false,
            daily_recap_time: NaiveTime::from_hms_opt(20, 0, 0).expect("valid time"),
            task_reminders_enabled: false,
            streak_risk_enabled: false,
            goal_progress_enabled: false,
            inactivity_enabled: false,
            achievement_enabled: false,
        }
    }
}

/// Namespaced preferences replica with reconciliation side effects.
pub struct PreferencesStore {
    inner: Arc<ReplicaStore<NotificationPreferences>>,
    reconciler: OnceCell<Arc<NotificationReconciler>>,
    /// Set while a remote pull is being applied so the write is not treated
    /// as a local edit (which would loop local -> remote -> local forever).
    applying_remote: AtomicBool,
    guest_namespace: String,
    settle_delay: Duration,
}

impl PreferencesStore {
    pub async fn new(
        kv: Arc<dyn KeyValueStore>,
        initial: &IdentitySnapshot,
        config: &CoreConfig,
    ) -> Result<Arc<Self>> {
        let inner = ReplicaStore::new(
            PREFERENCES_RESOURCE,
            kv,
            initial,
            config.guest_namespace.clone(),
        )
        .await?;
        Ok(Arc::new(Self {
            inner,
            reconciler: OnceCell::new(),
            applying_remote: AtomicBool::new(false),
            guest_namespace: config.guest_namespace.clone(),
            settle_delay: config.settle_delay,
        }))
    }

    /// Wire up the reconciler. Called once by the composition root; the
    /// reconciler itself only holds this store's watch channel, so there is
    /// no reference cycle.
    pub fn attach_reconciler(&self, reconciler: Arc<NotificationReconciler>) {
        if self.reconciler.set(reconciler).is_err() {
            warn!("reconciler already attached");
        }
    }

    pub async fn value(&self) -> NotificationPreferences {
        self.inner.value().await
    }

    pub fn watch(&self) -> watch::Receiver<NotificationPreferences> {
        self.inner.watch()
    }

    /// Local edit. A real change persists, notifies the sync engine, and
    /// kicks off an asynchronous reconciliation pass.
    pub async fn update(
        &self,
        transform: impl FnOnce(NotificationPreferences) -> NotificationPreferences,
    ) -> Result<bool> {
        let changed = self.inner.update(transform).await?;
        if changed && !self.applying_remote.load(Ordering::SeqCst) {
            self.spawn_reconcile("preferences_changed");
        }
        Ok(changed)
    }

    /// Apply remotely pulled preferences. Reconciles but does not count as a
    /// local edit; the sync engine suppresses the echo on the change stream.
    pub async fn apply_remote_preferences(
        &self,
        preferences: NotificationPreferences,
    ) -> Result<bool> {
        self.applying_remote.store(true, Ordering::SeqCst);
        let result = self.inner.apply_remote(preferences).await;
        self.applying_remote.store(false, Ordering::SeqCst);

        match &result {
            Ok(true) => self.spawn_reconcile("remote_preferences"),
            Ok(false) => debug!("remote preferences identical, nothing to do"),
            Err(_) => {}
        }
        result
    }

    /// Namespace switch with the account-isolation ordering: cancel every
    /// scheduled notification for the outgoing identity, then swap and load,
    /// then reconcile for the new identity after a settle delay so sibling
    /// stores finish their own switches first.
    pub async fn apply_namespace_change(&self, snapshot: &IdentitySnapshot) -> Result<bool> {
        let new_namespace = Namespace::for_identity(&snapshot.identity, &self.guest_namespace);
        if self.inner.current_namespace().await == new_namespace {
            return Ok(false);
        }

        if let Some(reconciler) = self.reconciler.get() {
            if let Err(e) = reconciler.cancel_all().await {
                warn!(error = %e, "cancel-all before namespace switch failed");
            }
        }

        self.inner.apply_namespace_change(snapshot).await?;

        if let Some(reconciler) = self.reconciler.get() {
            let reconciler = reconciler.clone();
            let delay = self.settle_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = reconciler.reconcile_all("namespace_switch").await {
                    warn!(error = %e, "post-switch reconciliation failed");
                }
            });
        }
        Ok(true)
    }

    fn spawn_reconcile(&self, reason: &'static str) {
        let Some(reconciler) = self.reconciler.get() else {
            debug!(reason, "no reconciler attached yet");
            return;
        };
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.reconcile_all(reason).await {
                warn!(reason, error = %e, "reconciliation failed");
            }
        });
    }
}

#[async_trait::async_trait]
impl SyncTarget<NotificationPreferences> for PreferencesStore {
    fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<NotificationPreferences> {
        self.inner.subscribe_changes()
    }

    async fn apply_remote(&self, value: NotificationPreferences) -> Result<bool> {
        self.apply_remote_preferences(value).await
    }
}
