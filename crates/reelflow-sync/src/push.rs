use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reelflow_notion::NotionClient;
use reelflow_store::TaskStore;
use reelflow_types::Task;

/// Properties the push loop is allowed to touch. Title, Topic, Story
/// Direction and Channel belong to the humans editing the planning page
/// and are never written from this side.
pub fn page_properties(task: &Task) -> Value {
    json!({
        "Status": { "status": { "name": task.status.label() } },
        "Priority": { "select": { "name": task.priority.label() } },
    })
}

pub struct PushLoop {
    store: TaskStore,
    notion: NotionClient,
    interval: Duration,
    shutdown: CancellationToken,
}

impl PushLoop {
    pub fn new(
        store: TaskStore,
        notion: NotionClient,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            notion,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "push loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
            if let Err(e) = self.push_once().await {
                // Whatever failed this cycle gets another chance next cycle.
                warn!(error = %e, "push cycle failed");
            }
        }
        info!("push loop stopped");
    }

    pub async fn push_once(&self) -> anyhow::Result<()> {
        let tasks = self.store.tasks_with_planning_page().await?;
        let mut pushed = 0usize;
        let mut failed = 0usize;

        for task in tasks {
            let Some(page_id) = task.planning_page_id.as_deref() else {
                continue;
            };
            let time_in_status = Utc::now() - task.updated_at;
            debug!(
                task_id = %task.id,
                status = %task.status,
                time_in_status_secs = time_in_status.num_seconds(),
                "pushing task state"
            );
            match self.notion.update_page(page_id, page_properties(&task)).await {
                Ok(_) => pushed += 1,
                Err(e) => {
                    failed += 1;
                    warn!(task_id = %task.id, page_id, error = %e, "page update failed");
                }
            }
        }

        info!(pushed, failed, "push cycle complete");
        Ok(())
    }
}
