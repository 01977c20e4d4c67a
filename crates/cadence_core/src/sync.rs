//! Debounced push / pull-once sync engine
//!
//! One `SyncEngine` instance keeps one local replica eventually consistent
//! with the remote authoritative store: a single pull per activated user,
//! debounced last-write-wins pushes for local edits, echo suppression so a
//! just-pulled value never bounces back, and 401-triggered credential
//! invalidation. Transport failures are never surfaced; the next trigger
//! retries implicitly.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

use crate::config::CoreConfig;
use crate::error::Result;
use crate::id::UserId;
use crate::replica::ReplicaStore;
use crate::session::{AuthCredential, SessionProvider};
use crate::util::Debouncer;

/// Failures a remote resource client can report. `Unauthorized` is kept
/// distinct because it triggers local credential invalidation instead of a
/// retry.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote rejected the credential")]
    Unauthorized,

    #[error("transport failure")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("malformed remote record")]
    Decode(#[source] serde_json::Error),
}

/// Authenticated CRUD against the backend for one resource type.
///
/// `fetch` maps 404/empty to `Ok(None)`, not an error. `upsert` is
/// full-record, keyed by the user: optional fields travel as explicit nulls
/// so the server cannot preserve stale values the client meant to clear.
#[async_trait]
pub trait RemoteResourceClient<T>: Send + Sync {
    fn resource_name(&self) -> &str;

    async fn fetch(
        &self,
        user_id: &UserId,
        credential: &AuthCredential,
    ) -> std::result::Result<Option<T>, RemoteError>;

    async fn upsert(
        &self,
        user_id: &UserId,
        record: &T,
        credential: &AuthCredential,
    ) -> std::result::Result<T, RemoteError>;
}

/// The local side a sync engine drives: a change-event stream of local edits
/// (and remote-apply echoes) plus the remote-apply entry point.
#[async_trait]
pub trait SyncTarget<T>: Send + Sync {
    fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<T>;

    /// Apply a remote value locally. Returns whether the value changed; an
    /// actual change emits exactly one echo on the change stream.
    async fn apply_remote(&self, value: T) -> Result<bool>;
}

#[async_trait]
impl<T> SyncTarget<T> for ReplicaStore<T>
where
    T: Clone + PartialEq + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<T> {
        ReplicaStore::subscribe_changes(self)
    }

    async fn apply_remote(&self, value: T) -> Result<bool> {
        ReplicaStore::apply_remote(self, value).await
    }
}

/// Per-(namespace, resource) sync bookkeeping. Reset whenever the active
/// user changes, so pulls and suppression never carry over between accounts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncCursor {
    pub active_user_id: Option<UserId>,
    pub has_pulled_once: bool,
    /// Consumed by the very next local-change observation, push or not. It
    /// never survives two edits.
    pub suppress_next_push: bool,
}

impl SyncCursor {
    fn reset_for(&mut self, user_id: Option<UserId>) {
        *self = SyncCursor {
            active_user_id: user_id,
            ..SyncCursor::default()
        };
    }
}

/// A local edit waiting in the debounce window, tagged with the user it was
/// made under so an identity switch mid-window drops it instead of pushing
/// it under the wrong account.
struct PendingPush<T> {
    value: T,
    edited_by: Option<UserId>,
}

/// Debounced local-to-remote push plus one remote-to-local pull per identity
/// activation, for a single resource.
pub struct SyncEngine<T: Send + 'static> {
    resource: String,
    session: Arc<SessionProvider>,
    client: Arc<dyn RemoteResourceClient<T>>,
    target: Arc<dyn SyncTarget<T>>,
    cursor: Mutex<SyncCursor>,
    debouncer: Debouncer<PendingPush<T>>,
}

impl<T> SyncEngine<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Build the engine. Must be called inside a tokio runtime: the debounce
    /// loop starts immediately.
    pub fn new(
        session: Arc<SessionProvider>,
        client: Arc<dyn RemoteResourceClient<T>>,
        target: Arc<dyn SyncTarget<T>>,
        config: &CoreConfig,
    ) -> Arc<Self> {
        let resource = client.resource_name().to_string();
        let window = config.debounce_window;

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let debouncer = Debouncer::spawn(window, move |pending: PendingPush<T>| {
                let weak = weak.clone();
                async move {
                    if let Some(engine) = weak.upgrade() {
                        engine.push(pending).await;
                    }
                }
            });
            Self {
                resource,
                session,
                client,
                target,
                cursor: Mutex::new(SyncCursor::default()),
                debouncer,
            }
        })
    }

    /// Start consuming the target's change events.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let mut changes = engine.target.subscribe_changes();
        tokio::spawn(async move {
            while let Some(value) = changes.recv().await {
                engine.observe_local_change(value).await;
            }
        });
    }

    /// Identity activation: runs after every namespaced store has switched.
    /// Pulls the remote record once per active user; a failed pull leaves the
    /// cursor unset so any later trigger retries.
    pub async fn activate(&self) {
        let Some(snapshot) = self.session.snapshot() else {
            trace!(resource = %self.resource, "activate: no usable session");
            return;
        };
        let (Some(user_id), Some(credential)) = (snapshot.user_id(), snapshot.credential) else {
            // Guests have namespaced local data but never sync.
            return;
        };

        let mut cursor = self.cursor.lock().await;
        if cursor.active_user_id != Some(user_id) {
            cursor.reset_for(Some(user_id));
        }
        if cursor.has_pulled_once {
            return;
        }

        match self.client.fetch(&user_id, &credential).await {
            Ok(Some(record)) => {
                // Set the flag before applying: the echo event queues behind
                // this cursor lock and consumes it.
                cursor.suppress_next_push = true;
                match self.target.apply_remote(record).await {
                    Ok(true) => {
                        cursor.has_pulled_once = true;
                        debug!(resource = %self.resource, user_id = %user_id, "pulled remote record");
                    }
                    Ok(false) => {
                        // Local already matched; no echo is coming.
                        cursor.suppress_next_push = false;
                        cursor.has_pulled_once = true;
                    }
                    Err(e) => {
                        cursor.suppress_next_push = false;
                        warn!(resource = %self.resource, error = %e, "remote apply failed");
                    }
                }
            }
            Ok(None) => {
                cursor.has_pulled_once = true;
                debug!(resource = %self.resource, user_id = %user_id, "no remote record");
            }
            Err(RemoteError::Unauthorized) => {
                debug!(resource = %self.resource, "pull unauthorized, invalidating credential");
                self.session.invalidate_credential();
            }
            Err(RemoteError::Decode(e)) => {
                // Malformed remote data counts as "no data"; local defaults
                // stand until the server record is repaired.
                warn!(resource = %self.resource, error = %e, "malformed remote record ignored");
                cursor.has_pulled_once = true;
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "pull failed, will retry on next trigger");
            }
        }
    }

    /// Current cursor state, for diagnostics and tests.
    pub async fn cursor(&self) -> SyncCursor {
        self.cursor.lock().await.clone()
    }

    async fn observe_local_change(&self, value: T) {
        let current_user = self.session.current_identity().user_id();

        let mut cursor = self.cursor.lock().await;
        if cursor.active_user_id != current_user {
            cursor.reset_for(current_user);
        }
        if cursor.suppress_next_push {
            cursor.suppress_next_push = false;
            trace!(resource = %self.resource, "echo suppressed");
            return;
        }
        drop(cursor);

        self.debouncer.submit(PendingPush {
            value,
            edited_by: current_user,
        });
    }

    /// Debounce fire: re-resolve the session and push the latest value.
    async fn push(&self, pending: PendingPush<T>) {
        let Some(snapshot) = self.session.snapshot() else {
            trace!(resource = %self.resource, "push dropped: sync disabled");
            return;
        };
        let (Some(user_id), Some(credential)) = (snapshot.user_id(), snapshot.credential) else {
            trace!(resource = %self.resource, "push dropped: guest session");
            return;
        };
        if pending.edited_by != Some(user_id) {
            debug!(resource = %self.resource, "push dropped: edit from a different identity");
            return;
        }

        match self.client.upsert(&user_id, &pending.value, &credential).await {
            Ok(_) => {
                debug!(resource = %self.resource, user_id = %user_id, "pushed local record");
            }
            Err(RemoteError::Unauthorized) => {
                debug!(resource = %self.resource, "push unauthorized, invalidating credential");
                self.session.invalidate_credential();
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "push failed, value stays local");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::replica::ReplicaStore;
    use crate::session::IdentitySnapshot;
    use crate::test_helpers::{MemoryKv, ScriptedOutcome, ScriptedRemote};
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    fn credential() -> AuthCredential {
        AuthCredential::new(
            "token".to_string(),
            None,
            Utc::now() + ChronoDuration::hours(1),
        )
    }

    struct Fixture {
        session: Arc<SessionProvider>,
        store: Arc<ReplicaStore<Counter>>,
        remote: Arc<ScriptedRemote<Counter>>,
        engine: Arc<SyncEngine<Counter>>,
    }

    async fn fixture() -> Fixture {
        let session = Arc::new(SessionProvider::new());
        let kv = Arc::new(MemoryKv::default());
        let store = ReplicaStore::new("counter", kv, &IdentitySnapshot::guest(), "guest")
            .await
            .unwrap();
        let remote = Arc::new(ScriptedRemote::<Counter>::new("counter"));
        let engine = SyncEngine::new(
            session.clone(),
            remote.clone(),
            store.clone(),
            &CoreConfig::default(),
        );
        engine.start();
        Fixture {
            session,
            store,
            remote,
            engine,
        }
    }

    async fn settle() {
        // Let spawned change-consumer tasks run under paused time.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_edits_into_one_push() {
        let f = fixture().await;
        let user_id = UserId::generate();
        f.session.sign_in_user(user_id, credential());

        for _ in 0..4 {
            f.store
                .update(|mut c| {
                    c.count += 1;
                    c
                })
                .await
                .unwrap();
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;

        let upserts = f.remote.upserts();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].1, Counter { count: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_edits_never_push() {
        let f = fixture().await;
        f.store
            .update(|mut c| {
                c.count = 7;
                c
            })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert!(f.remote.upserts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_once_applies_and_suppresses_echo() {
        let f = fixture().await;
        let user_id = UserId::generate();
        f.session.sign_in_user(user_id, credential());

        f.remote
            .script_fetch(ScriptedOutcome::Found(Counter { count: 42 }));
        f.engine.activate().await;
        settle().await;

        assert_eq!(f.store.value().await, Counter { count: 42 });
        assert_eq!(f.remote.fetch_count(), 1);

        // The echo of the applied value must not bounce back to the server.
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(f.remote.upserts().is_empty());

        // But a genuine local edit afterwards still pushes.
        f.store
            .update(|mut c| {
                c.count += 1;
                c
            })
            .await
            .unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        let upserts = f.remote.upserts();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].1, Counter { count: 43 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_activation_does_not_repull() {
        let f = fixture().await;
        f.session.sign_in_user(UserId::generate(), credential());

        f.remote.script_fetch(ScriptedOutcome::Missing);
        f.engine.activate().await;
        f.engine.activate().await;

        assert_eq!(f.remote.fetch_count(), 1);
        assert!(f.engine.cursor().await.has_pulled_once);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pull_retries_on_next_trigger() {
        let f = fixture().await;
        f.session.sign_in_user(UserId::generate(), credential());

        f.remote.script_fetch(ScriptedOutcome::Transport);
        f.engine.activate().await;
        assert!(!f.engine.cursor().await.has_pulled_once);

        f.remote
            .script_fetch(ScriptedOutcome::Found(Counter { count: 3 }));
        f.engine.activate().await;
        settle().await;
        assert!(f.engine.cursor().await.has_pulled_once);
        assert_eq!(f.store.value().await, Counter { count: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_pull_invalidates_credential() {
        let f = fixture().await;
        f.session.sign_in_user(UserId::generate(), credential());

        f.remote.script_fetch(ScriptedOutcome::Unauthorized);
        f.engine.activate().await;

        assert_eq!(f.session.snapshot(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_push_invalidates_credential() {
        let f = fixture().await;
        f.session.sign_in_user(UserId::generate(), credential());
        f.remote.fail_upserts_unauthorized();

        f.store
            .update(|mut c| {
                c.count = 1;
                c
            })
            .await
            .unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(f.session.snapshot(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_switch_resets_cursor() {
        let f = fixture().await;
        let user_a = UserId::generate();
        f.session.sign_in_user(user_a, credential());
        f.remote.script_fetch(ScriptedOutcome::Missing);
        f.engine.activate().await;
        assert_eq!(f.engine.cursor().await.active_user_id, Some(user_a));

        let user_b = UserId::generate();
        f.session.sign_in_user(user_b, credential());
        f.remote
            .script_fetch(ScriptedOutcome::Found(Counter { count: 9 }));
        f.engine.activate().await;
        settle().await;

        let cursor = f.engine.cursor().await;
        assert_eq!(cursor.active_user_id, Some(user_b));
        assert!(cursor.has_pulled_once);
        assert_eq!(f.remote.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_from_previous_identity_not_pushed() {
        let f = fixture().await;
        let user_a = UserId::generate();
        f.session.sign_in_user(user_a, credential());

        // Edit lands in the debounce window under user A...
        f.store
            .update(|mut c| {
                c.count = 5;
                c
            })
            .await
            .unwrap();
        settle().await;

        // ...then the identity changes before the window fires.
        f.session.sign_in_user(UserId::generate(), credential());
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert!(f.remote.upserts().is_empty());
    }
}
