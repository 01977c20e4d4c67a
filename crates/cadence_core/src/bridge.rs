//! Cross-process state bridge
//!
//! A single-slot, timestamped mailbox for one pending pause/resume change
//! written by an out-of-process UI surface (a widget or lock-screen
//! extension) that cannot call back into the main process. The main process
//! consumes the slot exactly once, typically on foregrounding. If the shared
//! storage is unavailable every operation degrades to a no-op or `None`;
//! the UI surface must never crash the host app.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// The one message the slot can hold. `written_at` is epoch milliseconds;
/// zero is the sentinel for "no message".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub is_paused: bool,
    pub remaining_seconds: u32,
    pub written_at: i64,
}

impl BridgeMessage {
    /// The cleared slot: all fields zeroed.
    pub fn empty() -> Self {
        Self {
            is_paused: false,
            remaining_seconds: 0,
            written_at: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.written_at == 0
    }
}

/// Storage shared between the main process and the external UI surface.
pub trait SharedSlotStorage: Send + Sync {
    fn read(&self) -> Result<Option<Vec<u8>>>;
    fn write(&self, bytes: &[u8]) -> Result<()>;
}

/// File-backed slot in a directory both processes can reach. Writes go
/// through a temp file and rename so a reader never sees a torn message.
pub struct FileSlotStorage {
    path: PathBuf,
}

impl FileSlotStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Slot under the platform data directory, shared by app name.
    pub fn in_shared_dir(app_name: &str) -> Result<Self> {
        let base = dirs::data_dir().ok_or_else(|| CoreError::BridgeUnavailable {
            cause: "no platform data directory".into(),
        })?;
        let dir = base.join(app_name);
        std::fs::create_dir_all(&dir).map_err(|e| CoreError::BridgeUnavailable {
            cause: Box::new(e),
        })?;
        Ok(Self::new(dir.join("bridge_slot.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SharedSlotStorage for FileSlotStorage {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::BridgeUnavailable {
                cause: Box::new(e),
            }),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| CoreError::BridgeUnavailable {
            cause: Box::new(e),
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CoreError::BridgeUnavailable {
            cause: Box::new(e),
        })
    }
}

/// Exactly-once mailbox over the shared slot. Last writer wins; there is no
/// queue.
pub struct CrossProcessBridge {
    storage: Arc<dyn SharedSlotStorage>,
    // Serializes read-then-clear so two consumers cannot both see the message.
    guard: Mutex<()>,
}

impl CrossProcessBridge {
    pub fn new(storage: Arc<dyn SharedSlotStorage>) -> Self {
        Self {
            storage,
            guard: Mutex::new(()),
        }
    }

    /// Overwrite the slot with a new pending state change, stamped now.
    pub fn write(&self, is_paused: bool, remaining_seconds: u32) {
        let message = BridgeMessage {
            is_paused,
            remaining_seconds,
            written_at: Utc::now().timestamp_millis(),
        };
        let _guard = self.guard.lock();
        if let Err(e) = self.store(&message) {
            warn!(error = %e, "bridge write dropped");
        }
    }

    /// Non-destructive read for passive monitors.
    pub fn peek(&self) -> Option<BridgeMessage> {
        let _guard = self.guard.lock();
        self.load()
    }

    /// Read and atomically clear the slot. A second consume right after
    /// returns `None`, even if `peek` was called in between.
    pub fn consume(&self) -> Option<BridgeMessage> {
        let _guard = self.guard.lock();
        let message = self.load()?;
        if let Err(e) = self.store(&BridgeMessage::empty()) {
            // Leave the message in place rather than risk losing it; the
            // next consume will retry the clear.
            warn!(error = %e, "bridge clear failed");
            return None;
        }
        debug!(is_paused = message.is_paused, "bridge message consumed");
        Some(message)
    }

    fn load(&self) -> Option<BridgeMessage> {
        let bytes = match self.storage.read() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "bridge read failed");
                return None;
            }
        };
        match serde_json::from_slice::<BridgeMessage>(&bytes) {
            Ok(message) if message.is_empty() => None,
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "malformed bridge slot ignored");
                None
            }
        }
    }

    fn store(&self, message: &BridgeMessage) -> Result<()> {
        let bytes = serde_json::to_vec(message)
            .map_err(|e| CoreError::serialization("bridge message", e))?;
        self.storage.write(&bytes)
    }
}
