#![cfg(test)]

//! In-memory fakes for the collaborator traits, shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::domain::{DomainSnapshot, DomainSnapshotProvider};
use crate::error::{CoreError, Result};
use crate::id::UserId;
use crate::reconcile::{NotificationScheduler, ScheduledNotification};
use crate::replica::KeyValueStore;
use crate::session::AuthCredential;
use crate::sync::{RemoteError, RemoteResourceClient};

/// In-memory key-value store.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Vec<u8>>,
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// A scripted fetch outcome for `ScriptedRemote`.
pub enum ScriptedOutcome<T> {
    Found(T),
    Missing,
    Unauthorized,
    Transport,
}

/// Remote client fake: fetch outcomes are scripted in order, upserts are
/// recorded.
pub struct ScriptedRemote<T> {
    resource: &'static str,
    fetches: Mutex<VecDeque<ScriptedOutcome<T>>>,
    fetch_count: AtomicUsize,
    upserts: Mutex<Vec<(UserId, T)>>,
    fail_upserts_unauthorized: Mutex<bool>,
}

impl<T> ScriptedRemote<T> {
    pub fn new(resource: &'static str) -> Self {
        Self {
            resource,
            fetches: Mutex::new(VecDeque::new()),
            fetch_count: AtomicUsize::new(0),
            upserts: Mutex::new(Vec::new()),
            fail_upserts_unauthorized: Mutex::new(false),
        }
    }

    pub fn script_fetch(&self, outcome: ScriptedOutcome<T>) {
        self.fetches.lock().push_back(outcome);
    }

    pub fn fail_upserts_unauthorized(&self) {
        *self.fail_upserts_unauthorized.lock() = true;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

impl<T: Clone> ScriptedRemote<T> {
    pub fn upserts(&self) -> Vec<(UserId, T)> {
        self.upserts.lock().clone()
    }
}

#[async_trait]
impl<T> RemoteResourceClient<T> for ScriptedRemote<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn resource_name(&self) -> &str {
        self.resource
    }

    async fn fetch(
        &self,
        _user_id: &UserId,
        _credential: &AuthCredential,
    ) -> std::result::Result<Option<T>, RemoteError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        match self.fetches.lock().pop_front() {
            Some(ScriptedOutcome::Found(value)) => Ok(Some(value)),
            Some(ScriptedOutcome::Missing) | None => Ok(None),
            Some(ScriptedOutcome::Unauthorized) => Err(RemoteError::Unauthorized),
            Some(ScriptedOutcome::Transport) => Err(RemoteError::Transport(Box::new(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "scripted timeout"),
            ))),
        }
    }

    async fn upsert(
        &self,
        user_id: &UserId,
        record: &T,
        _credential: &AuthCredential,
    ) -> std::result::Result<T, RemoteError> {
        if *self.fail_upserts_unauthorized.lock() {
            return Err(RemoteError::Unauthorized);
        }
        self.upserts.lock().push((*user_id, record.clone()));
        Ok(record.clone())
    }
}

/// Scheduler fake: tracks pending requests and an operation log so tests can
/// assert call ordering and counts.
#[derive(Default)]
pub struct RecordingScheduler {
    pending: Mutex<HashMap<String, ScheduledNotification>>,
    ops: Mutex<Vec<String>>,
    schedule_count: AtomicUsize,
}

impl RecordingScheduler {
    pub fn pending(&self) -> HashMap<String, ScheduledNotification> {
        self.pending.lock().clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    pub fn schedule_count(&self) -> usize {
        self.schedule_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationScheduler for RecordingScheduler {
    async fn schedule(&self, notification: ScheduledNotification) -> Result<()> {
        self.schedule_count.fetch_add(1, Ordering::SeqCst);
        self.ops
            .lock()
            .push(format!("schedule:{}", notification.identifier));
        self.pending
            .lock()
            .insert(notification.identifier.clone(), notification);
        Ok(())
    }

    async fn cancel(&self, identifiers: &[String]) -> Result<()> {
        let mut pending = self.pending.lock();
        let mut ops = self.ops.lock();
        for identifier in identifiers {
            ops.push(format!("cancel:{}", identifier));
            pending.remove(identifier);
        }
        Ok(())
    }

    async fn cancel_all(&self) -> Result<()> {
        self.ops.lock().push("cancel_all".to_string());
        self.pending.lock().clear();
        Ok(())
    }

    async fn pending_identifiers(&self) -> Result<HashSet<String>> {
        Ok(self.pending.lock().keys().cloned().collect())
    }
}

/// Domain snapshot provider returning a settable snapshot.
pub struct FixedDomainProvider {
    snapshot: Mutex<DomainSnapshot>,
}

impl FixedDomainProvider {
    pub fn new(snapshot: DomainSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: DomainSnapshot) {
        *self.snapshot.lock() = snapshot;
    }
}

#[async_trait]
impl DomainSnapshotProvider for FixedDomainProvider {
    async fn snapshot(&self) -> Result<DomainSnapshot> {
        Ok(self.snapshot.lock().clone())
    }
}

/// Shared-slot fake, optionally scripted as unavailable.
#[derive(Default)]
pub struct MemorySlot {
    slot: Mutex<Option<Vec<u8>>>,
    unavailable: bool,
}

impl MemorySlot {
    pub fn unavailable() -> Self {
        Self {
            slot: Mutex::new(None),
            unavailable: true,
        }
    }
}

impl crate::bridge::SharedSlotStorage for MemorySlot {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        if self.unavailable {
            return Err(CoreError::BridgeUnavailable {
                cause: "slot unavailable".into(),
            });
        }
        Ok(self.slot.lock().clone())
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.unavailable {
            return Err(CoreError::BridgeUnavailable {
                cause: "slot unavailable".into(),
            });
        }
        *self.slot.lock() = Some(bytes.to_vec());
        Ok(())
    }
}
