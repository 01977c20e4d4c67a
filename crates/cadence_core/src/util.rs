//! Utility functions and helpers for cadence-core

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

/// Serde support for `Duration` fields expressed as integer milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: u64 = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A trailing-edge debouncer: bursts of submitted values within the quiet
/// window collapse into a single invocation of the action, always carrying
/// the latest value.
///
/// This is the shared coalescing primitive behind every sync engine's push
/// path, so the timer-plus-latest-value logic lives in exactly one place.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawn the debounce loop. `action` fires once per quiet period with the
    /// most recent value submitted during the burst.
    pub fn spawn<F, Fut>(window: Duration, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();

        tokio::spawn(async move {
            while let Some(mut latest) = rx.recv().await {
                loop {
                    tokio::select! {
                        next = rx.recv() => match next {
                            // A newer value resets the quiet window.
                            Some(value) => latest = value,
                            None => {
                                action(latest).await;
                                return;
                            }
                        },
                        _ = tokio::time::sleep(window) => {
                            action(latest).await;
                            break;
                        }
                    }
                }
            }
        });

        Self { tx }
    }

    /// Submit a value. Never blocks; if the loop has shut down the value is
    /// silently dropped.
    pub fn submit(&self, value: T) {
        let _ = self.tx.send(value);
    }
}
