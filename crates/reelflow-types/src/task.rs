use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{Priority, TaskStatus};

/// One unit of end-to-end video production. The database row is the owner;
/// intermediate files are weakly referenced through the workspace layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub channel_id: String,
    /// Canonical 32-char hex id of the planning page, unique across tasks.
    pub planning_page_id: Option<String>,
    pub title: String,
    pub topic: Option<String>,
    pub story_direction: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Append-only; each failure or release adds a line.
    pub error_log: String,
    pub final_video_path: Option<String>,
    /// Running total; stages only ever add.
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a status transition may update alongside the status itself.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub error_log_append: Option<String>,
    pub final_video_path: Option<String>,
}

impl TaskPatch {
    pub fn error(line: impl Into<String>) -> Self {
        Self {
            error_log_append: Some(line.into()),
            final_video_path: None,
        }
    }
}

/// Planning-side change notification, stored only to reject replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
}

/// Per-channel daily YouTube unit counter, keyed by `(channel_id, date)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub channel_id: String,
    pub date: NaiveDate,
    pub units_used: i64,
    pub daily_limit: i64,
}

impl QuotaUsage {
    pub fn remaining(&self) -> i64 {
        (self.daily_limit - self.units_used).max(0)
    }
}
