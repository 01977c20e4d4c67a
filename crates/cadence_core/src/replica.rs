//! Namespaced local replicas
//!
//! Every synced resource keeps a local replica keyed by the active identity
//! namespace. `ReplicaStore` owns load/save for one resource, detects
//! namespace switches, and guarantees that a read immediately after a switch
//! reflects the new namespace's persisted value, never a stale one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::session::{IdentityKind, IdentitySnapshot};

/// Namespaced key-value byte store backing the replicas. The serialization
/// format is opaque to implementors; the core writes JSON.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Storage partition keyed by the active identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    pub fn for_identity(identity: &IdentityKind, guest_namespace: &str) -> Self {
        match identity {
            IdentityKind::Guest => Namespace(guest_namespace.to_string()),
            IdentityKind::User(user_id) => Namespace(user_id.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage key for one resource inside this namespace.
    pub fn storage_key(&self, resource: &str) -> String {
        format!("{}::{}", self.0, resource)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ReplicaState<T> {
    namespace: Namespace,
    value: T,
}

/// Local replica of one resource, keyed by the active namespace.
///
/// Mutation goes only through `update` / `apply_remote`; nothing else writes
/// the underlying persistence for this resource. Value changes fan out on a
/// watch channel for observers and on an event channel for the sync engine.
pub struct ReplicaStore<T> {
    resource_key: String,
    guest_namespace: String,
    kv: Arc<dyn KeyValueStore>,
    state: RwLock<ReplicaState<T>>,
    value_tx: watch::Sender<T>,
    change_subscribers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> ReplicaStore<T>
where
    T: Clone + PartialEq + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build the store and load the replica for the identity currently on the
    /// feed. The namespace is correct before any consumer can read the value.
    pub async fn new(
        resource_key: impl Into<String>,
        kv: Arc<dyn KeyValueStore>,
        initial: &IdentitySnapshot,
        guest_namespace: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let resource_key = resource_key.into();
        let guest_namespace = guest_namespace.into();
        let namespace = Namespace::for_identity(&initial.identity, &guest_namespace);
        let value = load_value::<T>(&kv, &namespace, &resource_key).await;
        let (value_tx, _) = watch::channel(value.clone());

        Ok(Arc::new(Self {
            resource_key,
            guest_namespace,
            kv,
            state: RwLock::new(ReplicaState { namespace, value }),
            value_tx,
            change_subscribers: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub async fn current_namespace(&self) -> Namespace {
        self.state.read().await.namespace.clone()
    }

    /// Current replica value.
    pub async fn value(&self) -> T {
        self.state.read().await.value.clone()
    }

    /// Watch channel reflecting the current value, including after namespace
    /// switches and remote applies.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.value_tx.subscribe()
    }

    /// Stream of change events (local edits and remote-apply echoes), one
    /// event per real value change. Namespace switches do not appear here:
    /// a reloaded value is not an edit and must never be pushed.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.change_subscribers.lock().push(tx);
        rx
    }

    /// Compute-compare-commit update. Returns `Ok(false)` without persisting
    /// or notifying when the transform produces an equal value.
    pub async fn update(&self, transform: impl FnOnce(T) -> T) -> Result<bool> {
        let mut state = self.state.write().await;
        let next = transform(state.value.clone());
        if next == state.value {
            return Ok(false);
        }
        self.persist(&state.namespace, &next).await?;
        state.value = next.clone();
        drop(state);
        self.notify(next);
        Ok(true)
    }

    /// Apply a remote-pulled value. Persists and emits a change event (the
    /// echo the sync engine suppresses) unless the value is already current.
    pub async fn apply_remote(&self, value: T) -> Result<bool> {
        let mut state = self.state.write().await;
        if value == state.value {
            return Ok(false);
        }
        self.persist(&state.namespace, &value).await?;
        state.value = value.clone();
        drop(state);
        self.notify(value);
        Ok(true)
    }

    /// Re-key the store for a new identity. Returns `Ok(true)` if the
    /// namespace actually changed. The swap and load happen under the write
    /// lock, so no reader observes a half-switched state.
    pub async fn apply_namespace_change(&self, snapshot: &IdentitySnapshot) -> Result<bool> {
        let new_namespace = Namespace::for_identity(&snapshot.identity, &self.guest_namespace);
        {
            let state = self.state.read().await;
            if state.namespace == new_namespace {
                return Ok(false);
            }
        }

        let mut state = self.state.write().await;
        // Re-check under the write lock; switches are serialized upstream but
        // the lock makes the swap atomic regardless.
        if state.namespace == new_namespace {
            return Ok(false);
        }
        let loaded = load_value::<T>(&self.kv, &new_namespace, &self.resource_key).await;
        debug!(
            resource = %self.resource_key,
            from = %state.namespace,
            to = %new_namespace,
            "namespace switch"
        );
        state.namespace = new_namespace;
        state.value = loaded.clone();
        drop(state);
        // Observers see the reloaded value; the change-event channel stays
        // quiet because this is not an edit.
        self.value_tx.send_replace(loaded);
        Ok(true)
    }

    async fn persist(&self, namespace: &Namespace, value: &T) -> Result<()> {
        let key = namespace.storage_key(&self.resource_key);
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CoreError::serialization(self.resource_key.clone(), e))?;
        self.kv.set(&key, bytes).await
    }

    fn notify(&self, value: T) {
        self.value_tx.send_replace(value.clone());
        self.change_subscribers
            .lock()
            .retain(|tx| tx.send(value.clone()).is_ok());
    }
}

/// Load the persisted value for `(namespace, resource)`, falling back to the
/// type default when absent or malformed. Decode failures are diagnostics,
/// not errors: the replica heals on the next successful sync.
async fn load_value<T>(kv: &Arc<dyn KeyValueStore>, namespace: &Namespace, resource: &str) -> T
where
    T: Default + DeserializeOwned,
{
    let key = namespace.storage_key(resource);
    match kv.get(&key).await {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "malformed replica record, using default");
                T::default()
            }
        },
        Ok(None) => T::default(),
        Err(e) => {
            warn!(key = %key, error = %e, "replica load failed, using default");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::UserId;
    use crate::test_helpers::MemoryKv;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn guest_snapshot() -> IdentitySnapshot {
        IdentitySnapshot::guest()
    }

    async fn new_store(kv: Arc<dyn KeyValueStore>) -> Arc<ReplicaStore<Note>> {
        ReplicaStore::new("note", kv, &guest_snapshot(), "guest")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_persists_and_notifies() {
        let kv = Arc::new(MemoryKv::default());
        let store = new_store(kv.clone()).await;
        let mut changes = store.subscribe_changes();

        let changed = store
            .update(|mut note| {
                note.text = "hello".to_string();
                note
            })
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(changes.recv().await.unwrap().text, "hello");

        let raw = kv.get("guest::note").await.unwrap().unwrap();
        let stored: Note = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored.text, "hello");
    }

    #[tokio::test]
    async fn test_equal_update_is_noop() {
        let kv = Arc::new(MemoryKv::default());
        let store = new_store(kv.clone()).await;
        let mut changes = store.subscribe_changes();

        let changed = store.update(|note| note).await.unwrap();
        assert!(!changed);
        assert!(changes.try_recv().is_err());
        assert_eq!(kv.get("guest::note").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let kv = Arc::new(MemoryKv::default());
        let store = new_store(kv.clone()).await;
        store
            .update(|mut note| {
                note.text = "guest data".to_string();
                note
            })
            .await
            .unwrap();

        let user_id = UserId::generate();
        let switched = store
            .apply_namespace_change(&IdentitySnapshot::user(user_id, None))
            .await
            .unwrap();
        assert!(switched);
        // Fresh namespace starts from the default, not the guest value.
        assert_eq!(store.value().await, Note::default());

        // Switching back re-reads the guest replica.
        store
            .apply_namespace_change(&guest_snapshot())
            .await
            .unwrap();
        assert_eq!(store.value().await.text, "guest data");
    }

    #[tokio::test]
    async fn test_switch_to_same_namespace_is_noop() {
        let kv = Arc::new(MemoryKv::default());
        let store = new_store(kv).await;
        let switched = store
            .apply_namespace_change(&guest_snapshot())
            .await
            .unwrap();
        assert!(!switched);
    }

    #[tokio::test]
    async fn test_namespace_switch_emits_no_change_event() {
        let kv = Arc::new(MemoryKv::default());
        let store = new_store(kv).await;
        let mut changes = store.subscribe_changes();

        store
            .apply_namespace_change(&IdentitySnapshot::user(UserId::generate(), None))
            .await
            .unwrap();
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_record_falls_back_to_default() {
        let kv = Arc::new(MemoryKv::default());
        kv.set("guest::note", b"not json".to_vec()).await.unwrap();
        let store = new_store(kv).await;
        assert_eq!(store.value().await, Note::default());
    }

    #[tokio::test]
    async fn test_apply_remote_echoes_once() {
        let kv = Arc::new(MemoryKv::default());
        let store = new_store(kv).await;
        let mut changes = store.subscribe_changes();

        let remote = Note {
            text: "from server".to_string(),
        };
        assert!(store.apply_remote(remote.clone()).await.unwrap());
        assert_eq!(changes.recv().await.unwrap(), remote);

        // Applying the identical value again emits nothing.
        assert!(!store.apply_remote(remote).await.unwrap());
        assert!(changes.try_recv().is_err());
    }
}
