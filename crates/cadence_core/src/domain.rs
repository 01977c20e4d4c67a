//! Domain payloads for the synced resources and reconciler inputs
//!
//! Synced records serialize every optional field explicitly (no
//! `skip_serializing_if`): the remote upsert is full-record, and a field the
//! client intends to clear must arrive as an explicit null rather than be
//! silently preserved server-side.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::{HabitId, TaskId};

/// Synced user profile record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub timezone: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One tracked habit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Habit {
    pub id: HabitId,
    pub name: String,
    pub streak_days: u32,
    pub remind_at: Option<NaiveTime>,
    pub last_completed: Option<NaiveDate>,
    pub archived: bool,
}

impl Habit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: HabitId::generate(),
            name: name.into(),
            streak_days: 0,
            remind_at: None,
            last_completed: None,
            archived: false,
        }
    }

    /// A habit with an active streak not yet completed today is at risk of
    /// losing it.
    pub fn streak_at_risk(&self, today: NaiveDate) -> bool {
        !self.archived && self.streak_days > 0 && self.last_completed != Some(today)
    }
}

/// Synced habit collection record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HabitCollection {
    pub habits: Vec<Habit>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Synced stats settings record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSettings {
    pub weekly_focus_goal_minutes: Option<u32>,
    pub week_starts_monday: bool,
    pub show_streaks: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// An upcoming task reminder the reconciler may surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReminder {
    pub task_id: TaskId,
    pub title: String,
    pub remind_at: DateTime<Utc>,
}

/// An engagement nudge computed by the domain stores (streak risk, goal
/// progress, inactivity, achievement). The reconciler gates each kind by its
/// preference switch; the eligibility logic lives upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nudge {
    pub kind: NudgeKind,
    /// Stable suffix for the notification identifier, e.g. a habit id.
    pub key: String,
    pub title: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeKind {
    StreakRisk,
    GoalProgress,
    Inactivity,
    Achievement,
}

impl NudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NudgeKind::StreakRisk => "streak_risk",
            NudgeKind::GoalProgress => "goal_progress",
            NudgeKind::Inactivity => "inactivity",
            NudgeKind::Achievement => "achievement",
        }
    }
}

/// Point-in-time view of the domain data the reconciler needs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub upcoming_task_reminders: Vec<TaskReminder>,
    pub nudges: Vec<Nudge>,
}

/// Collaborator feeding the reconciler a current domain snapshot. The task
/// and habit stores behind this call the reconciler again after their own
/// persistence completes, so the snapshot is always post-write.
#[async_trait]
pub trait DomainSnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> Result<DomainSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_streak_risk() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let mut habit = Habit::new("stretch");
        assert!(!habit.streak_at_risk(today));

        habit.streak_days = 4;
        assert!(habit.streak_at_risk(today));

        habit.last_completed = Some(today);
        assert!(!habit.streak_at_risk(today));

        habit.last_completed = None;
        habit.archived = true;
        assert!(!habit.streak_at_risk(today));
    }

    #[test]
    fn test_profile_serializes_cleared_fields_explicitly() {
        let profile = UserProfile {
            display_name: Some("Noor".to_string()),
            avatar_url: None,
            timezone: None,
            updated_at: None,
        };
        let json = serde_json::to_value(&profile).unwrap();
        // Cleared fields must reach the upsert as explicit nulls.
        assert_eq!(json["avatar_url"], serde_json::Value::Null);
        assert_eq!(json["timezone"], serde_json::Value::Null);
    }
}
