use serde_json::Value;
use tracing::{info, warn};

use reelflow_notion::{normalize_page_id, page, NotionClient, NotionError};
use reelflow_registry::ChannelRegistry;
use reelflow_store::{NewTask, StoreError, TaskStore};
use reelflow_types::{Priority, TaskPatch, TaskStatus};

/// What processing one webhook delivery amounted to.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Replay of an event we already hold; nothing was mutated.
    Duplicate,
    Created { task_id: uuid::Uuid },
    Updated { task_id: uuid::Uuid },
    /// Accepted but produced no task mutation (validation failure, page
    /// deleted, or a planning-side edit the store out-ranks).
    Skipped { reason: String },
}

/// Fields extracted from a planning page, validated for task creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePatch {
    pub title: String,
    pub channel_id: String,
    pub topic: Option<String>,
    pub story_direction: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
}

impl PagePatch {
    /// Validate the page's required fields. A page failing here stays in
    /// draft on the planning side and no task row is created.
    pub fn from_page(page_value: &Value) -> Result<PagePatch, String> {
        let title = page::title(page_value, "Title")
            .or_else(|| page::title(page_value, "Name"))
            .ok_or_else(|| "missing required field `Title`".to_string())?;
        let channel_id = page::select(page_value, "Channel")
            .ok_or_else(|| "missing required field `Channel`".to_string())?;

        let priority = page::select(page_value, "Priority")
            .and_then(|label| Priority::parse_label(&label))
            .unwrap_or_default();
        let status = page::status(page_value, "Status")
            .and_then(|label| TaskStatus::parse_label(&label))
            .unwrap_or(TaskStatus::Draft);

        Ok(PagePatch {
            title,
            channel_id,
            topic: page::rich_text(page_value, "Topic"),
            story_direction: page::rich_text(page_value, "Story Direction"),
            priority,
            status,
        })
    }
}

/// Pull the page id out of a webhook payload. Deliveries carry either a
/// flat `page_id` or a nested `entity.id`.
pub fn payload_page_id(payload: &Value) -> Option<String> {
    payload
        .get("page_id")
        .and_then(Value::as_str)
        .or_else(|| {
            payload
                .get("entity")
                .and_then(|e| e.get("id"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
}

pub struct WebhookProcessor {
    store: TaskStore,
    notion: NotionClient,
    registry: ChannelRegistry,
}

impl WebhookProcessor {
    pub fn new(store: TaskStore, notion: NotionClient, registry: ChannelRegistry) -> Self {
        Self {
            store,
            notion,
            registry,
        }
    }

    /// Process one delivery. Safe to call any number of times with the
    /// same `event_id`: exactly one store mutation happens in total.
    pub async fn process(&self, event_id: &str, payload: &Value) -> anyhow::Result<IngestOutcome> {
        if !self.store.record_webhook(event_id, payload).await? {
            info!(event_id, "duplicate webhook delivery acknowledged");
            return Ok(IngestOutcome::Duplicate);
        }

        let outcome = self.apply(payload).await;
        self.store.mark_webhook_processed(event_id).await?;
        outcome
    }

    async fn apply(&self, payload: &Value) -> anyhow::Result<IngestOutcome> {
        let Some(raw_page_id) = payload_page_id(payload) else {
            return Ok(IngestOutcome::Skipped {
                reason: "payload carries no page id".to_string(),
            });
        };
        self.process_page(&raw_page_id).await
    }

    /// Reconcile one planning page outside the webhook path, e.g. during
    /// the startup sweep over the configured planning databases.
    pub async fn process_page(&self, raw_page_id: &str) -> anyhow::Result<IngestOutcome> {
        let page_id = match normalize_page_id(raw_page_id) {
            Ok(id) => id,
            Err(e) => {
                return Ok(IngestOutcome::Skipped {
                    reason: format!("bad page id: {e}"),
                })
            }
        };

        let page_value = match self.notion.get_page(&page_id).await {
            Ok(value) => value,
            // Deleted between the event and the fetch; nothing to create.
            Err(NotionError::NotFound(_)) => {
                return Ok(IngestOutcome::Skipped {
                    reason: format!("page {page_id} no longer exists"),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let patch = match PagePatch::from_page(&page_value) {
            Ok(patch) => patch,
            Err(reason) => {
                warn!(page_id, reason = %reason, "page failed validation, staying in draft");
                return Ok(IngestOutcome::Skipped { reason });
            }
        };

        if self.registry.snapshot().await.get(&patch.channel_id).is_none() {
            let reason = format!("unknown channel `{}`", patch.channel_id);
            warn!(page_id, reason = %reason, "page failed validation, staying in draft");
            return Ok(IngestOutcome::Skipped { reason });
        }

        match self.store.get_task_by_page(&page_id).await? {
            None => {
                let task = self
                    .store
                    .create_task(NewTask {
                        channel_id: patch.channel_id,
                        planning_page_id: Some(page_id.clone()),
                        title: patch.title,
                        topic: patch.topic,
                        story_direction: patch.story_direction,
                        priority: patch.priority,
                        status: patch.status,
                    })
                    .await;
                match task {
                    Ok(task) => {
                        info!(page_id, task_id = %task.id, status = %task.status, "task created from planning page");
                        Ok(IngestOutcome::Created { task_id: task.id })
                    }
                    // Lost a race with a concurrent delivery of a sibling
                    // event; the winner's row stands.
                    Err(StoreError::AlreadyExists) => Ok(IngestOutcome::Skipped {
                        reason: "task already exists for this page".to_string(),
                    }),
                    Err(e) => Err(e.into()),
                }
            }
            Some(existing) => {
                if existing.status == patch.status {
                    return Ok(IngestOutcome::Skipped {
                        reason: "no status change".to_string(),
                    });
                }
                if !existing.status.can_transition_to(patch.status) {
                    // The store out-ranks the planning side; the next push
                    // cycle rewrites the page's status.
                    return Ok(IngestOutcome::Skipped {
                        reason: format!(
                            "planning-side edit {} -> {} out-ranked by the store",
                            existing.status, patch.status
                        ),
                    });
                }
                match self
                    .store
                    .update_status(existing.id, existing.status, patch.status, TaskPatch::default())
                    .await
                {
                    Ok(task) => {
                        info!(page_id, task_id = %task.id, status = %task.status, "task advanced from planning page");
                        Ok(IngestOutcome::Updated { task_id: task.id })
                    }
                    Err(StoreError::Conflict { .. }) => Ok(IngestOutcome::Skipped {
                        reason: "task transitioned concurrently".to_string(),
                    }),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_page() -> Value {
        json!({
            "properties": {
                "Title": { "title": [{"plain_text": "Volcano documentary"}] },
                "Channel": { "select": {"name": "ch_nature"} },
                "Priority": { "select": {"name": "High"} },
                "Status": { "status": {"name": "Queued"} },
                "Topic": { "rich_text": [{"plain_text": "geology"}] }
            }
        })
    }

    #[test]
    fn valid_page_extracts_every_field() {
        let patch = PagePatch::from_page(&valid_page()).expect("patch");
        assert_eq!(patch.title, "Volcano documentary");
        assert_eq!(patch.channel_id, "ch_nature");
        assert_eq!(patch.priority, Priority::High);
        assert_eq!(patch.status, TaskStatus::Queued);
        assert_eq!(patch.topic.as_deref(), Some("geology"));
        assert_eq!(patch.story_direction, None);
    }

    #[test]
    fn missing_title_fails_validation() {
        let mut page = valid_page();
        page["properties"]
            .as_object_mut()
            .expect("props")
            .remove("Title");
        let err = PagePatch::from_page(&page).expect_err("invalid");
        assert!(err.contains("Title"));
    }

    #[test]
    fn missing_channel_fails_validation() {
        let mut page = valid_page();
        page["properties"]
            .as_object_mut()
            .expect("props")
            .remove("Channel");
        assert!(PagePatch::from_page(&page).is_err());
    }

    #[test]
    fn unknown_labels_fall_back_to_defaults() {
        let mut page = valid_page();
        page["properties"]["Priority"]["select"]["name"] = json!("Urgent!!");
        page["properties"]["Status"]["status"]["name"] = json!("Daydreaming");
        let patch = PagePatch::from_page(&page).expect("patch");
        assert_eq!(patch.priority, Priority::Normal);
        assert_eq!(patch.status, TaskStatus::Draft);
    }

    #[test]
    fn payload_page_id_reads_both_shapes() {
        let flat = json!({"page_id": "abc"});
        let nested = json!({"entity": {"id": "def"}});
        assert_eq!(payload_page_id(&flat).as_deref(), Some("abc"));
        assert_eq!(payload_page_id(&nested).as_deref(), Some("def"));
        assert_eq!(payload_page_id(&json!({})), None);
    }
}
