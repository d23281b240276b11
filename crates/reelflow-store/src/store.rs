use chrono::NaiveDate;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use reelflow_types::{
    Channel, Priority, QuotaUsage, Task, TaskPatch, TaskStatus, DEFAULT_DAILY_LIMIT,
};

use crate::error::StoreError;
use crate::schema::MIGRATIONS;

/// `updated_at` must strictly increase per row on every write, even when
/// two writes land inside one clock tick.
pub(crate) const BUMP_UPDATED_AT: &str =
    "GREATEST(clock_timestamp(), updated_at + interval '1 microsecond')";

#[derive(Debug, Clone)]
pub struct NewTask {
    pub channel_id: String,
    pub planning_page_id: Option<String>,
    pub title: String,
    pub topic: Option<String>,
    pub story_direction: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub channel_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pool that only dials on first use. Handy for components that may
    /// never touch the database in a given process.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = MIGRATIONS.len(), "schema migration applied");
        Ok(())
    }

    pub async fn upsert_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO channels (id, name, active, max_concurrent, voice_id, storage_strategy, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, now())
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                active = EXCLUDED.active,
                max_concurrent = EXCLUDED.max_concurrent,
                voice_id = EXCLUDED.voice_id,
                storage_strategy = EXCLUDED.storage_strategy,
                updated_at = now()",
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(channel.active)
        .bind(channel.max_concurrent as i32)
        .bind(&channel.voice_id)
        .bind(channel.storage_strategy.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic insert. The unique constraint on `planning_page_id` turns a
    /// duplicate into `AlreadyExists` instead of a raised database error.
    pub async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let row = sqlx::query(
            "INSERT INTO tasks (id, channel_id, planning_page_id, title, topic, story_direction, priority, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (planning_page_id) WHERE planning_page_id IS NOT NULL DO NOTHING
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&new.channel_id)
        .bind(&new.planning_page_id)
        .bind(&new.title)
        .bind(&new.topic)
        .bind(&new.story_direction)
        .bind(new.priority.as_str())
        .bind(new.status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(StoreError::AlreadyExists),
        }
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        task_from_row(&row)
    }

    pub async fn get_task_by_page(&self, planning_page_id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE planning_page_id = $1")
            .bind(planning_page_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut sql = String::from("SELECT * FROM tasks WHERE TRUE");
        if filter.status.is_some() {
            sql.push_str(" AND status = $1");
        }
        if filter.channel_id.is_some() {
            sql.push_str(if filter.status.is_some() {
                " AND channel_id = $2"
            } else {
                " AND channel_id = $1"
            });
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ");
        sql.push_str(&filter.limit.unwrap_or(100).clamp(1, 1000).to_string());

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str().to_string());
        }
        if let Some(channel_id) = filter.channel_id {
            query = query.bind(channel_id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    /// All tasks the sync push loop cares about.
    pub async fn tasks_with_planning_page(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE planning_page_id IS NOT NULL ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Compare-and-set status transition. Rejects edges that are not on the
    /// pipeline graph before touching the database, and reports `Conflict`
    /// when another actor already moved the row.
    pub async fn update_status(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { from, to });
        }

        let log_line = patch
            .error_log_append
            .map(|line| format!("[{}] {}\n", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), line))
            .unwrap_or_default();

        let sql = format!(
            "UPDATE tasks
             SET status = $1,
                 error_log = error_log || $2,
                 final_video_path = COALESCE($3, final_video_path),
                 updated_at = {BUMP_UPDATED_AT}
             WHERE id = $4 AND status = $5
             RETURNING *"
        );
        let row = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(log_line)
            .bind(patch.final_video_path)
            .bind(id)
            .bind(from.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(StoreError::Conflict { id, expected: from }),
        }
    }

    /// Monotonic cost accumulation: stages may only add.
    pub async fn record_cost(&self, id: Uuid, delta_usd: f64) -> Result<(), StoreError> {
        if delta_usd < 0.0 {
            return Err(StoreError::NegativeDelta(delta_usd));
        }
        let sql = format!(
            "UPDATE tasks SET cost_usd = cost_usd + $1, updated_at = {BUMP_UPDATED_AT} WHERE id = $2"
        );
        let result = sqlx::query(&sql)
            .bind(delta_usd)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Insert a webhook event. Returns `true` for a fresh event, `false`
    /// for a replay; replays must not cause any further work.
    pub async fn record_webhook(
        &self,
        event_id: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO webhook_events (event_id, payload)
             VALUES ($1, $2)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_webhook_processed(&self, event_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE webhook_events SET processed = TRUE WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn quota_get(
        &self,
        channel_id: &str,
        day: NaiveDate,
    ) -> Result<QuotaUsage, StoreError> {
        let row = sqlx::query(
            "SELECT units_used, daily_limit FROM youtube_quota_usage
             WHERE channel_id = $1 AND date = $2",
        )
        .bind(channel_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => QuotaUsage {
                channel_id: channel_id.to_string(),
                date: day,
                units_used: row.try_get("units_used")?,
                daily_limit: row.try_get("daily_limit")?,
            },
            None => QuotaUsage {
                channel_id: channel_id.to_string(),
                date: day,
                units_used: 0,
                daily_limit: DEFAULT_DAILY_LIMIT,
            },
        })
    }

    pub async fn quota_add(
        &self,
        channel_id: &str,
        day: NaiveDate,
        delta: i64,
    ) -> Result<(), StoreError> {
        if delta < 0 {
            return Err(StoreError::NegativeDelta(delta as f64));
        }
        sqlx::query(
            "INSERT INTO youtube_quota_usage (channel_id, date, units_used)
             VALUES ($1, $2, $3)
             ON CONFLICT (channel_id, date)
             DO UPDATE SET units_used = youtube_quota_usage.units_used + EXCLUDED.units_used",
        )
        .bind(channel_id)
        .bind(day)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn quota_purge(&self, older_than_days: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM youtube_quota_usage WHERE date < CURRENT_DATE - $1::int",
        )
        .bind(older_than_days as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

pub(crate) fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let priority_raw: String = row.try_get("priority")?;
    let status_raw: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        planning_page_id: row.try_get("planning_page_id")?,
        title: row.try_get("title")?,
        topic: row.try_get("topic")?,
        story_direction: row.try_get("story_direction")?,
        priority: Priority::parse(&priority_raw)
            .ok_or_else(|| StoreError::InvalidRow(format!("priority `{priority_raw}`")))?,
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::InvalidRow(format!("status `{status_raw}`")))?,
        error_log: row.try_get("error_log")?,
        final_video_path: row.try_get("final_video_path")?,
        cost_usd: row.try_get("cost_usd")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
