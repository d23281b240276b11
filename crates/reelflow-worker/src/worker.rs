//! The long-running claim -> gate -> dispatch cycle.
//!
//! Workers are stateless and interchangeable; identity is a name used only
//! for logging. Task-level failures never bring the loop down, and
//! shutdown lets the in-flight iteration finish before the loop exits.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use reelflow_observability::{emit_event, ObservabilityEvent, ProcessKind};
use reelflow_registry::ChannelRegistry;
use reelflow_store::{StoreError, TaskStore};
use reelflow_types::{Task, TaskPatch, TaskStatus};

use crate::gate::{Admission, WorkerGate};
use crate::pipeline::{Dispatcher, StageOutcome};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

pub struct WorkerLoop {
    store: TaskStore,
    registry: ChannelRegistry,
    dispatcher: Dispatcher,
    gate: Arc<WorkerGate>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerLoop {
    pub fn new(
        store: TaskStore,
        registry: ChannelRegistry,
        dispatcher: Dispatcher,
        gate: Arc<WorkerGate>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            gate,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!(worker = %self.config.name, "worker loop started");
        while !self.shutdown.is_cancelled() {
            match self.store.claim_next().await {
                Ok(Some(task)) => {
                    let task_id = task.id.to_string();
                    self.process(task).await;
                    emit_event(
                        Level::INFO,
                        ProcessKind::Worker,
                        ObservabilityEvent {
                            event: "worker.heartbeat",
                            component: "worker.loop",
                            task_id: Some(&task_id),
                            channel_id: None,
                            stage: None,
                            status: None,
                            error_code: None,
                            detail: Some(&self.config.name),
                        },
                    );
                }
                Ok(None) => self.idle().await,
                Err(e) => {
                    // Database trouble is retriable at this level; back off
                    // one poll interval and try again.
                    warn!(worker = %self.config.name, error = %e, "claim failed");
                    self.idle().await;
                }
            }
        }
        info!(worker = %self.config.name, "worker loop stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn process(&self, task: Task) {
        let snapshot = self.registry.snapshot().await;
        let Some(channel) = snapshot.get(&task.channel_id).cloned() else {
            // A task referencing a channel the registry does not know is a
            // configuration fault, not something another attempt can fix.
            self.fail(
                &task,
                task.status,
                format!("unknown channel `{}`", task.channel_id),
            )
            .await;
            return;
        };

        let admission = match self.gate.admit(&task, &channel).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "gate check failed, releasing");
                self.release(&task, format!("gate check failed: {e}")).await;
                return;
            }
        };

        let permit = match admission {
            Admission::Admit(permit) => permit,
            Admission::Release { reason } => {
                self.release(&task, reason).await;
                return;
            }
        };

        let run = self.dispatcher.run(&task, &channel, &self.gate).await;
        drop(permit);

        match run {
            Ok(run) => match run.outcome {
                StageOutcome::Advance => {}
                StageOutcome::Retry(reason) => self.retry(&task, run.status, reason).await,
                StageOutcome::Fatal(reason) => self.fail(&task, run.status, reason).await,
            },
            Err(e) => match e.downcast_ref::<StoreError>() {
                Some(store_err) if store_err.is_retriable() => {
                    debug!(task_id = %task.id, error = %e, "stage lost a race, leaving row as-is");
                }
                _ => {
                    self.fail(&task, task.status, format!("stage crashed: {e}"))
                        .await
                }
            },
        }
    }

    async fn release(&self, task: &Task, reason: String) {
        match self.store.release(task, &reason).await {
            Ok(_) => debug!(task_id = %task.id, reason = %reason, "task released"),
            Err(e) => warn!(task_id = %task.id, error = %e, "release failed"),
        }
    }

    async fn retry(&self, task: &Task, current: TaskStatus, reason: String) {
        let Some(prior) = current.prior_runnable() else {
            error!(task_id = %task.id, status = %current, "retry from a non-worker status");
            return;
        };
        match self
            .store
            .update_status(task.id, current, prior, TaskPatch::error(reason.clone()))
            .await
        {
            Ok(_) => info!(task_id = %task.id, from = %current, to = %prior, reason = %reason, "task re-queued"),
            Err(e) => warn!(task_id = %task.id, error = %e, "re-queue failed"),
        }
    }

    async fn fail(&self, task: &Task, current: TaskStatus, reason: String) {
        let Some(terminal) = current.error_state() else {
            error!(task_id = %task.id, status = %current, reason = %reason, "no error state for status");
            return;
        };
        match self
            .store
            .update_status(task.id, current, terminal, TaskPatch::error(reason.clone()))
            .await
        {
            Ok(_) => warn!(task_id = %task.id, terminal = %terminal, reason = %reason, "task failed"),
            Err(e) => error!(task_id = %task.id, error = %e, "terminal transition failed"),
        }
    }
}
