//! Notification reconciliation
//!
//! The reconciler is the single owner of the device's notification scheduler.
//! Every pass recomputes the canonical set of scheduled notifications from
//! current preferences plus a domain snapshot, then applies only the delta
//! against what is already pending. Full cancel-then-reschedule is reserved
//! for identity changes and process start; `reconcile_all` itself never
//! wipes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::domain::{DomainSnapshot, DomainSnapshotProvider};
use crate::error::Result;
use crate::preferences::NotificationPreferences;

/// Identifier for the daily focus reminder notification.
pub const DAILY_REMINDER_ID: &str = "daily_reminder";
/// Identifier for the evening recap notification.
pub const DAILY_RECAP_ID: &str = "daily_recap";

/// What the user sees when a notification fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub category: String,
}

/// One entry in the canonical scheduled set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub identifier: String,
    pub fire_at: DateTime<Utc>,
    pub payload: NotificationPayload,
}

/// Device notification scheduler collaborator. Scheduling an identifier that
/// is already pending replaces the existing request.
#[async_trait]
pub trait NotificationScheduler: Send + Sync {
    async fn schedule(&self, notification: ScheduledNotification) -> Result<()>;
    async fn cancel(&self, identifiers: &[String]) -> Result<()>;
    async fn cancel_all(&self) -> Result<()>;
    async fn pending_identifiers(&self) -> Result<HashSet<String>>;
}

/// Recomputes and applies the canonical notification set.
pub struct NotificationReconciler {
    scheduler: Arc<dyn NotificationScheduler>,
    preferences: watch::Receiver<NotificationPreferences>,
    domain: Arc<dyn DomainSnapshotProvider>,
    /// Last applied set. Doubles as the pass lock: passes are serialized, and
    /// the record lets a repeat pass with unchanged inputs make zero
    /// scheduler calls even for identifiers whose fire time would otherwise
    /// need re-checking.
    applied: Mutex<HashMap<String, ScheduledNotification>>,
}

impl NotificationReconciler {
    pub fn new(
        scheduler: Arc<dyn NotificationScheduler>,
        preferences: watch::Receiver<NotificationPreferences>,
        domain: Arc<dyn DomainSnapshotProvider>,
    ) -> Self {
        Self {
            scheduler,
            preferences,
            domain,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Unconditionally clear every pending notification owned by the app,
    /// regardless of preferences. Used before namespace switches and at
    /// process start so nothing from a prior run or account survives.
    pub async fn cancel_all(&self) -> Result<()> {
        let mut applied = self.applied.lock().await;
        self.scheduler.cancel_all().await?;
        applied.clear();
        debug!("cancelled all scheduled notifications");
        Ok(())
    }

    /// One reconciliation pass: read preferences, compute the canonical set,
    /// apply the delta. Idempotent: a second pass with unchanged inputs makes
    /// zero scheduler calls.
    pub async fn reconcile_all(&self, reason: &str) -> Result<()> {
        let mut applied = self.applied.lock().await;

        let preferences = self.preferences.borrow().clone();
        if !preferences.master_enabled {
            let pending = self.scheduler.pending_identifiers().await?;
            if !pending.is_empty() {
                self.scheduler.cancel_all().await?;
            }
            applied.clear();
            debug!(reason, "master switch off, nothing scheduled");
            return Ok(());
        }

        let snapshot = self.domain.snapshot().await?;
        let now = Utc::now();
        let desired = desired_set(&preferences, &snapshot, now);
        let pending = self.scheduler.pending_identifiers().await?;

        let stale: Vec<String> = pending
            .iter()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        if !stale.is_empty() {
            self.scheduler.cancel(&stale).await?;
        }

        let mut scheduled = 0usize;
        for (identifier, notification) in &desired {
            let unchanged =
                pending.contains(identifier) && applied.get(identifier) == Some(notification);
            if !unchanged {
                self.scheduler.schedule(notification.clone()).await?;
                scheduled += 1;
            }
        }

        info!(
            reason,
            desired = desired.len(),
            scheduled,
            cancelled = stale.len(),
            "reconciled notifications"
        );
        *applied = desired;
        Ok(())
    }
}

/// The canonical set for the given preferences and domain data. Entries whose
/// fire time has already passed are excluded.
fn desired_set(
    preferences: &NotificationPreferences,
    snapshot: &DomainSnapshot,
    now: DateTime<Utc>,
) -> HashMap<String, ScheduledNotification> {
    let mut desired = HashMap::new();

    if preferences.daily_reminder_enabled {
        desired.insert(
            DAILY_REMINDER_ID.to_string(),
            ScheduledNotification {
                identifier: DAILY_REMINDER_ID.to_string(),
                fire_at: next_occurrence(preferences.daily_reminder_time, now),
                payload: NotificationPayload {
                    title: "Time to focus".to_string(),
                    body: "Start today's first focus session.".to_string(),
                    category: "daily_reminder".to_string(),
                },
            },
        );
    }

    if preferences.daily_recap_enabled {
        desired.insert(
            DAILY_RECAP_ID.to_string(),
            ScheduledNotification {
                identifier: DAILY_RECAP_ID.to_string(),
                fire_at: next_occurrence(preferences.daily_recap_time, now),
                payload: NotificationPayload {
                    title: "Daily recap".to_string(),
                    body: "See how today went.".to_string(),
                    category: "daily_recap".to_string(),
                },
            },
        );
    }

    if preferences.task_reminders_enabled {
        for reminder in &snapshot.upcoming_task_reminders {
            if reminder.remind_at <= now {
                continue;
            }
            let identifier = format!("task_reminder_{}", reminder.task_id);
            desired.insert(
                identifier.clone(),
                ScheduledNotification {
                    identifier,
                    fire_at: reminder.remind_at,
                    payload: NotificationPayload {
                        title: reminder.title.clone(),
                        body: "Task reminder".to_string(),
                        category: "task_reminder".to_string(),
                    },
                },
            );
        }
    }

    for nudge in &snapshot.nudges {
        let enabled = match nudge.kind {
            crate::domain::NudgeKind::StreakRisk => preferences.streak_risk_enabled,
            crate::domain::NudgeKind::GoalProgress => preferences.goal_progress_enabled,
            crate::domain::NudgeKind::Inactivity => preferences.inactivity_enabled,
            crate::domain::NudgeKind::Achievement => preferences.achievement_enabled,
        };
        if !enabled || nudge.fire_at <= now {
            continue;
        }
        let identifier = format!("{}_{}", nudge.kind.as_str(), nudge.key);
        desired.insert(
            identifier.clone(),
            ScheduledNotification {
                identifier,
                fire_at: nudge.fire_at,
                payload: NotificationPayload {
                    title: nudge.title.clone(),
                    body: nudge.body.clone(),
                    category: nudge.kind.as_str().to_string(),
                },
            },
        );
    }

    desired
}

/// Next occurrence of a time of day: today if still ahead, otherwise
/// tomorrow. Times of day are interpreted in UTC; the host maps wall-clock
/// input to UTC before it reaches the preferences.
fn next_occurrence(time: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}
