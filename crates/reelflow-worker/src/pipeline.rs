//! Status-driven pipeline dispatch.
//!
//! Each worker-owned status maps to one stage procedure with the uniform
//! shape claim -> external work -> persist -> advance. Stages are
//! restartable: inputs come from the task row and from artifact paths that
//! are a pure function of `(channel, project)`, and re-running a stage
//! overwrites its outputs. No database transaction is held while a tool
//! runs.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use reelflow_registry::ChannelRegistry;
use reelflow_store::TaskStore;
use reelflow_tools::ToolRunner;
use reelflow_types::{Channel, CoreError, Task, TaskPatch, TaskStatus};
use reelflow_workspace::{ArtifactKind, Workspace};

use crate::gate::WorkerGate;

/// What a stage did with the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The success transition is already persisted.
    Advance,
    /// Transient failure: send the task back to its prior runnable status.
    Retry(String),
    /// Permanent failure: move the task to the stage's error state.
    Fatal(String),
}

/// The seven external stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Assets,
    Composites,
    Video,
    Audio,
    Sfx,
    Assemble,
    Upload,
}

impl StageKind {
    pub fn for_status(status: TaskStatus) -> Option<StageKind> {
        match status {
            TaskStatus::Claimed | TaskStatus::GeneratingAssets => Some(StageKind::Assets),
            TaskStatus::GeneratingComposites => Some(StageKind::Composites),
            TaskStatus::GeneratingVideo => Some(StageKind::Video),
            TaskStatus::GeneratingAudio => Some(StageKind::Audio),
            TaskStatus::GeneratingSfx => Some(StageKind::Sfx),
            TaskStatus::Assembling => Some(StageKind::Assemble),
            TaskStatus::Uploading => Some(StageKind::Upload),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Assets => "assets",
            StageKind::Composites => "composites",
            StageKind::Video => "video",
            StageKind::Audio => "audio",
            StageKind::Sfx => "sfx",
            StageKind::Assemble => "assemble",
            StageKind::Upload => "upload",
        }
    }

    /// Status a successful run advances to.
    fn success_status(self) -> TaskStatus {
        match self {
            StageKind::Assets => TaskStatus::AssetsReady,
            StageKind::Composites => TaskStatus::CompositesReady,
            StageKind::Video => TaskStatus::VideoReady,
            StageKind::Audio => TaskStatus::AudioReady,
            StageKind::Sfx => TaskStatus::SfxReady,
            StageKind::Assemble => TaskStatus::AssemblyReady,
            StageKind::Upload => TaskStatus::Published,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageSettings {
    pub tool: String,
    pub timeout_secs: u64,
    pub retry_budget: u32,
}

impl StageSettings {
    fn new(tool: &str, timeout_secs: u64) -> Self {
        Self {
            tool: tool.to_string(),
            timeout_secs,
            retry_budget: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub assets: StageSettings,
    pub composites: StageSettings,
    pub video: StageSettings,
    pub audio: StageSettings,
    pub sfx: StageSettings,
    pub assemble: StageSettings,
    pub upload: StageSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            assets: StageSettings::new("generate_assets", 900),
            composites: StageSettings::new("compose_scenes", 600),
            video: StageSettings::new("generate_video", 1800),
            audio: StageSettings::new("generate_audio", 900),
            sfx: StageSettings::new("generate_sfx", 600),
            assemble: StageSettings::new("assemble_video", 1200),
            upload: StageSettings::new("upload_youtube", 1800),
        }
    }
}

impl PipelineConfig {
    fn for_kind(&self, kind: StageKind) -> &StageSettings {
        match kind {
            StageKind::Assets => &self.assets,
            StageKind::Composites => &self.composites,
            StageKind::Video => &self.video,
            StageKind::Audio => &self.audio,
            StageKind::Sfx => &self.sfx,
            StageKind::Assemble => &self.assemble,
            StageKind::Upload => &self.upload,
        }
    }
}

/// What the dispatcher reports back to the worker loop.
#[derive(Debug)]
pub struct StageRun {
    /// Worker-owned status the task is in now; the loop CASes failure
    /// transitions from here.
    pub status: TaskStatus,
    pub outcome: StageOutcome,
}

pub struct Dispatcher {
    store: TaskStore,
    tools: ToolRunner,
    workspace: Workspace,
    registry: ChannelRegistry,
    config: PipelineConfig,
}

impl Dispatcher {
    pub fn new(
        store: TaskStore,
        tools: ToolRunner,
        workspace: Workspace,
        registry: ChannelRegistry,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            tools,
            workspace,
            registry,
            config,
        }
    }

    /// Advance a claimed task by one stage.
    pub async fn run(
        &self,
        task: &Task,
        channel: &Channel,
        gate: &WorkerGate,
    ) -> anyhow::Result<StageRun> {
        let Some(kind) = StageKind::for_status(task.status) else {
            anyhow::bail!("task {} is not worker-owned in status {}", task.id, task.status);
        };

        // A freshly claimed task records the stage start before any
        // external work, so a crash between here and the tool call leaves
        // an in-progress row for the stale reclaim to pick up.
        let current = if task.status == TaskStatus::Claimed {
            self.store
                .update_status(
                    task.id,
                    TaskStatus::Claimed,
                    TaskStatus::GeneratingAssets,
                    TaskPatch::default(),
                )
                .await?
                .status
        } else {
            task.status
        };

        let settings = self.config.for_kind(kind);
        let project = task.id.simple().to_string();

        let args = match self.stage_args(kind, task, channel, &project).await {
            Ok(args) => args,
            Err(e) => {
                return Ok(StageRun {
                    status: current,
                    outcome: StageOutcome::Fatal(format!("stage input error: {e}")),
                })
            }
        };

        debug!(task_id = %task.id, stage = kind.name(), tool = %settings.tool, "dispatching stage");
        let result = self
            .tools
            .run(&settings.tool, &args, Duration::from_secs(settings.timeout_secs))
            .await;

        match result {
            Ok(output) => {
                if let Some(cost) = parse_cost(&output.stdout) {
                    self.store.record_cost(task.id, cost).await?;
                }
                self.finish(kind, task, channel, current, gate).await?;
                info!(task_id = %task.id, stage = kind.name(), "stage complete");
                Ok(StageRun {
                    status: current,
                    outcome: StageOutcome::Advance,
                })
            }
            Err(err) => Ok(StageRun {
                status: current,
                outcome: classify_failure(kind, err, &task.error_log, settings.retry_budget, gate),
            }),
        }
    }

    /// Persist the success transition(s) for a finished stage.
    async fn finish(
        &self,
        kind: StageKind,
        task: &Task,
        channel: &Channel,
        current: TaskStatus,
        gate: &WorkerGate,
    ) -> anyhow::Result<()> {
        let mut patch = TaskPatch::default();
        if kind == StageKind::Assemble {
            let videos = self
                .workspace
                .project_dir(&task.channel_id, &task.id.simple().to_string(), ArtifactKind::Videos)?;
            patch.final_video_path = Some(videos.join("final.mp4").display().to_string());
        }

        self.store
            .update_status(task.id, current, kind.success_status(), patch)
            .await?;

        match kind {
            // The assembled cut goes straight to its review gate.
            StageKind::Assemble => {
                self.store
                    .update_status(
                        task.id,
                        TaskStatus::AssemblyReady,
                        TaskStatus::FinalReview,
                        TaskPatch::default(),
                    )
                    .await?;
            }
            StageKind::Upload => {
                gate.record_upload(&channel.id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Argument list for one stage. Inputs are complete on the command
    /// line; all paths come from the workspace pather so nothing a tool
    /// sees can leave the channel tree.
    async fn stage_args(
        &self,
        kind: StageKind,
        task: &Task,
        channel: &Channel,
        project: &str,
    ) -> anyhow::Result<Vec<String>> {
        let dir = |kind: ArtifactKind| -> anyhow::Result<String> {
            Ok(self
                .workspace
                .project_dir(&task.channel_id, project, kind)?
                .display()
                .to_string())
        };

        let mut args = vec![
            "--channel".to_string(),
            channel.id.clone(),
            "--project".to_string(),
            project.to_string(),
        ];

        match kind {
            StageKind::Assets => {
                args.extend([
                    "--title".to_string(),
                    task.title.clone(),
                    "--characters-dir".to_string(),
                    dir(ArtifactKind::Characters)?,
                    "--environments-dir".to_string(),
                    dir(ArtifactKind::Environments)?,
                    "--props-dir".to_string(),
                    dir(ArtifactKind::Props)?,
                ]);
                if let Some(topic) = &task.topic {
                    args.extend(["--topic".to_string(), topic.clone()]);
                }
                if let Some(direction) = &task.story_direction {
                    args.extend(["--story-direction".to_string(), direction.clone()]);
                }
            }
            StageKind::Composites => {
                args.extend([
                    "--characters-dir".to_string(),
                    dir(ArtifactKind::Characters)?,
                    "--environments-dir".to_string(),
                    dir(ArtifactKind::Environments)?,
                    "--props-dir".to_string(),
                    dir(ArtifactKind::Props)?,
                    "--output-dir".to_string(),
                    dir(ArtifactKind::Composites)?,
                ]);
            }
            StageKind::Video => {
                args.extend([
                    "--composites-dir".to_string(),
                    dir(ArtifactKind::Composites)?,
                    "--output-dir".to_string(),
                    dir(ArtifactKind::Videos)?,
                ]);
            }
            StageKind::Audio => {
                args.extend([
                    "--voice".to_string(),
                    channel.voice_id.clone(),
                    "--title".to_string(),
                    task.title.clone(),
                    "--output-dir".to_string(),
                    dir(ArtifactKind::Audio)?,
                ]);
                if let Some(direction) = &task.story_direction {
                    args.extend(["--story-direction".to_string(), direction.clone()]);
                }
            }
            StageKind::Sfx => {
                args.extend([
                    "--videos-dir".to_string(),
                    dir(ArtifactKind::Videos)?,
                    "--output-dir".to_string(),
                    dir(ArtifactKind::Sfx)?,
                ]);
            }
            StageKind::Assemble => {
                args.extend([
                    "--videos-dir".to_string(),
                    dir(ArtifactKind::Videos)?,
                    "--audio-dir".to_string(),
                    dir(ArtifactKind::Audio)?,
                    "--sfx-dir".to_string(),
                    dir(ArtifactKind::Sfx)?,
                    "--output".to_string(),
                    format!("{}/final.mp4", dir(ArtifactKind::Videos)?),
                ]);
                for (flag, path) in [
                    ("--intro", &channel.branding.intro),
                    ("--outro", &channel.branding.outro),
                    ("--watermark", &channel.branding.watermark),
                ] {
                    if let Some(path) = path {
                        args.extend([flag.to_string(), path.clone()]);
                    }
                }
            }
            StageKind::Upload => {
                let video = task
                    .final_video_path
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("no assembled video recorded"))?;
                let token = self.registry.credential(&channel.id, "youtube").await?;
                args.extend([
                    "--video".to_string(),
                    video,
                    "--title".to_string(),
                    task.title.clone(),
                    "--token".to_string(),
                    token,
                ]);
            }
        }
        Ok(args)
    }
}

/// Map a tool error onto the stage outcome, per the propagation policy:
/// quota markers feed the gate, transient failures retry until the stage's
/// budget is spent, everything malformed is fatal.
fn classify_failure(
    kind: StageKind,
    err: CoreError,
    error_log: &str,
    retry_budget: u32,
    gate: &WorkerGate,
) -> StageOutcome {
    match err {
        CoreError::Timeout { program, seconds } => {
            budgeted_retry(kind, error_log, retry_budget, format!("{program} timed out after {seconds}s"))
        }
        CoreError::RateLimited(reason) | CoreError::Conflict(reason) => {
            budgeted_retry(kind, error_log, retry_budget, reason)
        }
        CoreError::ToolFailure {
            program,
            exit_code,
            stderr,
        } => {
            if kind == StageKind::Assets && is_quota_marker(&stderr) {
                gate.mark_gemini_exhausted(Utc::now());
                return StageOutcome::Retry(retry_line(
                    kind,
                    "image provider quota exhausted".to_string(),
                ));
            }
            if kind == StageKind::Upload && is_quota_marker(&stderr) {
                return StageOutcome::Retry(retry_line(
                    kind,
                    "upload quota reported exhausted".to_string(),
                ));
            }
            let detail = format!("{program} exited {exit_code}: {stderr}");
            budgeted_retry(kind, error_log, retry_budget, detail)
        }
        CoreError::Validation(reason) | CoreError::Auth(reason) => {
            StageOutcome::Fatal(format!("stage={} {reason}", kind.name()))
        }
        CoreError::NotFound(reason) | CoreError::PathEscape(reason) => {
            StageOutcome::Fatal(format!("stage={} {reason}", kind.name()))
        }
    }
}

fn retry_line(kind: StageKind, detail: String) -> String {
    format!("stage={} retry: {detail}", kind.name())
}

fn budgeted_retry(
    kind: StageKind,
    error_log: &str,
    retry_budget: u32,
    detail: String,
) -> StageOutcome {
    let spent = retry_count(error_log, kind);
    if spent >= retry_budget {
        StageOutcome::Fatal(format!(
            "stage={} retries exhausted after {spent} attempts: {detail}",
            kind.name()
        ))
    } else {
        StageOutcome::Retry(retry_line(kind, detail))
    }
}

/// Retries already spent on a stage, read back from the append-only log.
fn retry_count(error_log: &str, kind: StageKind) -> u32 {
    let marker = format!("stage={} retry:", kind.name());
    error_log.matches(marker.as_str()).count() as u32
}

fn is_quota_marker(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    crate::gate::QUOTA_STDERR_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Stage tools report spend as a `cost_usd=<float>` line on stdout.
fn parse_cost(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("cost_usd="))
        .filter_map(|raw| raw.trim().parse::<f64>().ok())
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}
