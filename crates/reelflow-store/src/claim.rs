//! The claim protocol. One query selects the single next admissible task
//! under `FOR UPDATE SKIP LOCKED` and moves it into its worker-owned status
//! inside the same transaction, so parallel workers partition the queue
//! without coordinating anywhere but the database.
//!
//! Ordering is (priority rank, per-channel queue position, channel id,
//! created_at): priority tiers are absolute; inside a tier every channel's
//! frontmost task competes at position one, so scheduler attention rotates
//! across channels with pending work instead of draining one channel's
//! backlog first. The position is ranked over pending and in-flight rows
//! alike: work a channel already has in progress keeps its slot, which is
//! what pushes the channel's next task behind its neighbours'. created_at
//! keeps FIFO within one `(priority, channel)` pair.

use std::fmt::Write as _;
use std::time::Duration;

use reelflow_types::{Task, TaskStatus};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{task_from_row, TaskStore, BUMP_UPDATED_AT};

fn quoted_list(statuses: impl Iterator<Item = TaskStatus>) -> String {
    let mut out = String::new();
    for (i, status) in statuses.enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "'{}'", status.as_str());
    }
    out
}

fn runnable_list() -> String {
    quoted_list(TaskStatus::ALL.into_iter().filter(|s| s.is_runnable()))
}

fn in_progress_list() -> String {
    quoted_list(TaskStatus::ALL.into_iter().filter(|s| s.is_in_progress()))
}

/// `CASE status ... END` arms mapping each status through `map`.
fn status_case(map: impl Fn(TaskStatus) -> Option<TaskStatus>) -> String {
    let mut out = String::from("CASE status");
    for status in TaskStatus::ALL {
        if let Some(target) = map(status) {
            let _ = write!(out, " WHEN '{}' THEN '{}'", status.as_str(), target.as_str());
        }
    }
    out.push_str(" END");
    out
}

impl TaskStore {
    /// Claim the single next task, or `None` when there is nothing to do.
    ///
    /// Filters: runnable status, channel active, and the channel's count of
    /// worker-owned rows below its `max_concurrent`. Rows locked by a
    /// concurrent claim are skipped, not waited on.
    ///
    /// The per-channel position is ranked in its own CTE: Postgres rejects
    /// `FOR UPDATE` in a select that carries a window function, so the lock
    /// is taken in the outer query against the ranked snapshot.
    pub async fn claim_next(&self) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            "WITH ranked AS (
                 SELECT id, row_number() OVER (
                            PARTITION BY channel_id, priority
                            ORDER BY created_at
                        ) AS channel_pos
                 FROM tasks
                 WHERE status IN ({runnable},{in_progress})
             ),
             candidate AS (
                 SELECT t.id
                 FROM tasks t
                 JOIN channels c ON c.id = t.channel_id
                 JOIN ranked r ON r.id = t.id
                 WHERE t.status IN ({runnable})
                   AND c.active
                   AND (SELECT count(*) FROM tasks busy
                        WHERE busy.channel_id = t.channel_id
                          AND busy.status IN ({in_progress})) < c.max_concurrent
                 ORDER BY CASE t.priority WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END,
                          r.channel_pos,
                          t.channel_id,
                          t.created_at
                 FOR UPDATE OF t SKIP LOCKED
                 LIMIT 1
             )
             UPDATE tasks
             SET status = {claim_case},
                 updated_at = {BUMP_UPDATED_AT}
             FROM candidate
             WHERE tasks.id = candidate.id
             RETURNING tasks.*",
            runnable = runnable_list(),
            in_progress = in_progress_list(),
            claim_case = status_case(|s| s.claim_target()),
        );

        let row = sqlx::query(&sql).fetch_optional(self.pool()).await?;
        match row {
            Some(row) => {
                let task = task_from_row(&row)?;
                debug!(task_id = %task.id, channel = %task.channel_id, status = %task.status, "claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Hand a claimed task back to the queue, e.g. when an admission gate
    /// refuses it. Compare-and-set on the worker-owned status.
    pub async fn release(
        &self,
        task: &Task,
        reason: &str,
    ) -> Result<Task, StoreError> {
        let Some(prior) = task.status.prior_runnable() else {
            return Err(StoreError::IllegalTransition {
                from: task.status,
                to: task.status,
            });
        };
        self.update_status(
            task.id,
            task.status,
            prior,
            reelflow_types::TaskPatch::error(format!("released: {reason}")),
        )
        .await
    }

    /// Return worker-owned rows that have not moved for longer than
    /// `stale_after` to their prior runnable status. A worker that died
    /// mid-stage left its row like this; the daemon runs this sweep on the
    /// claim poll cadence, so the next claim round after a row crosses the
    /// threshold picks the task up again and the stage's file idempotency
    /// does the rest.
    ///
    /// `stale_after` must exceed the longest stage timeout, or a healthy
    /// slow stage would be reclaimed out from under its worker.
    pub async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE tasks
             SET status = {release_case},
                 error_log = error_log || $1,
                 updated_at = {BUMP_UPDATED_AT}
             WHERE status IN ({in_progress})
               AND updated_at < now() - $2::interval",
            release_case = status_case(|s| s.prior_runnable()),
            in_progress = in_progress_list(),
        );

        let note = format!(
            "[{}] reclaimed from a stalled worker\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        );
        let interval = format!("{} seconds", stale_after.as_secs());
        let result = sqlx::query(&sql)
            .bind(note)
            .bind(interval)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
