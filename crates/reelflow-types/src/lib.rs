mod channel;
mod error;
mod status;
mod task;

pub use channel::{BrandingPaths, Channel, StorageStrategy};
pub use error::CoreError;
pub use status::{Priority, TaskStatus};
pub use task::{QuotaUsage, Task, TaskPatch, WebhookEvent};

/// YouTube API units consumed by one video upload.
pub const UPLOAD_COST_UNITS: i64 = 1_600;

/// Default per-channel daily YouTube unit budget.
pub const DEFAULT_DAILY_LIMIT: i64 = 10_000;
