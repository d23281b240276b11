use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;

use reelflow_notion::normalize_page_id;

/// Process configuration, read from the environment once at startup.
/// Anything malformed here is fatal before any loop starts.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub crypto_key: String,
    pub db_url: String,
    pub planning_api_token: String,
    pub planning_database_ids: Vec<String>,
    pub sync_interval: Duration,
    pub max_concurrent_video: u32,
    pub alert_webhook_url: Option<String>,
    pub quota_tz: FixedOffset,
    pub worker_name: String,
    pub worker_count: u32,
    pub channels_file: PathBuf,
    pub workspace_root: PathBuf,
    pub tools_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub webhook_secret: Option<String>,
    pub poll_interval: Duration,
    pub stale_claim_after: Duration,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} is required"))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{name}={raw} is invalid: {e}")),
        None => Ok(default),
    }
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        let offset_hours: i32 = parsed_or("QUOTA_TIMEZONE_OFFSET", -8)?;
        if !(-23..=23).contains(&offset_hours) {
            bail!("QUOTA_TIMEZONE_OFFSET={offset_hours} is out of range");
        }
        let quota_tz = FixedOffset::east_opt(offset_hours * 3600)
            .context("QUOTA_TIMEZONE_OFFSET does not form a valid offset")?;

        let planning_database_ids = optional("PLANNING_DATABASE_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|id| {
                        normalize_page_id(id)
                            .map_err(|e| anyhow::anyhow!("PLANNING_DATABASE_IDS entry: {e}"))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            crypto_key: required("CRYPTO_KEY")?,
            db_url: required("DB_URL")?,
            planning_api_token: required("PLANNING_API_TOKEN")?,
            planning_database_ids,
            sync_interval: Duration::from_secs(parsed_or("SYNC_INTERVAL_SECONDS", 60u64)?),
            max_concurrent_video: parsed_or("MAX_CONCURRENT_VIDEO", 3u32)?,
            alert_webhook_url: optional("ALERT_WEBHOOK_URL"),
            quota_tz,
            worker_name: optional("REELFLOW_WORKER_NAME").unwrap_or_else(|| "worker".to_string()),
            worker_count: parsed_or("REELFLOW_WORKER_COUNT", 1u32)?.max(1),
            channels_file: optional("REELFLOW_CHANNELS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("channels.yaml")),
            workspace_root: optional("REELFLOW_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("workspace")),
            tools_dir: optional("REELFLOW_TOOLS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tools")),
            logs_dir: optional("REELFLOW_LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
            bind_addr: parsed_or("REELFLOW_BIND_ADDR", "0.0.0.0:8080".parse()?)?,
            webhook_secret: optional("REELFLOW_WEBHOOK_SECRET"),
            poll_interval: Duration::from_millis(parsed_or("REELFLOW_POLL_INTERVAL_MS", 5_000u64)?),
            stale_claim_after: Duration::from_secs(
                parsed_or("REELFLOW_STALE_CLAIM_MINUTES", 30u64)? * 60,
            ),
        })
    }
}
