//! Cadence Core - Identity-Scoped Sync and Notification Reconciliation
//!
//! This crate provides the synchronization core that keeps Cadence's local
//! replicas (profile, habits, stats settings, notification preferences)
//! consistent with the remote store across identity changes, drives the
//! device's scheduled notifications without duplicates or cross-account
//! leakage, and bridges state changes from out-of-process UI surfaces.

pub mod bridge;
pub mod config;
pub mod domain;
pub mod error;
pub mod id;
pub mod preferences;
pub mod reconcile;
pub mod replica;
pub mod runtime;
pub mod session;
pub mod sync;
pub mod util;

#[cfg(test)]
mod test_helpers;

pub use bridge::{BridgeMessage, CrossProcessBridge, FileSlotStorage, SharedSlotStorage};
pub use config::CoreConfig;
pub use domain::{
    DomainSnapshot, DomainSnapshotProvider, Habit, HabitCollection, Nudge, NudgeKind,
    StatsSettings, TaskReminder, UserProfile,
};
pub use error::{CoreError, Result};
pub use id::{HabitId, Id, IdType, TaskId, UserId};
pub use preferences::{NotificationPreferences, PreferencesStore};
pub use reconcile::{
    NotificationPayload, NotificationReconciler, NotificationScheduler, ScheduledNotification,
};
pub use replica::{KeyValueStore, Namespace, ReplicaStore};
pub use runtime::{CoreRuntime, CoreRuntimeBuilder};
pub use session::{AuthCredential, IdentityFeed, IdentityKind, IdentitySnapshot, SessionProvider};
pub use sync::{RemoteError, RemoteResourceClient, SyncCursor, SyncEngine, SyncTarget};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        AuthCredential, BridgeMessage, CoreConfig, CoreError, CoreRuntime, CrossProcessBridge,
        DomainSnapshot, DomainSnapshotProvider, HabitCollection, IdentityKind, IdentitySnapshot,
        KeyValueStore, NotificationPreferences, NotificationReconciler, NotificationScheduler,
        PreferencesStore, RemoteResourceClient, ReplicaStore, Result, ScheduledNotification,
        SessionProvider, StatsSettings, SyncEngine, UserId, UserProfile,
    };
}
