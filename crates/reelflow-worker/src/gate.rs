//! Admission gate, checked after a claim and before any external call.
//!
//! Three independent admissions: the per-channel daily YouTube unit budget,
//! a transient image-generation exhaustion flag, and a video-generation
//! concurrency ceiling. The flag and the counter are process-local on
//! purpose: each worker process converges on its own, which costs at most
//! one wasted claim per process per exhaustion episode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tracing::{info, warn, Level};

use reelflow_observability::{emit_event, ObservabilityEvent, ProcessKind};
use reelflow_store::TaskStore;
use reelflow_types::{Channel, Task, TaskStatus, UPLOAD_COST_UNITS};

const ALERT_THROTTLE: Duration = Duration::from_secs(300);
const ALERT_THRESHOLDS: [f64; 2] = [0.8, 1.0];

/// stderr fragments tools emit when a provider quota is gone. Compared
/// case-insensitively.
pub const QUOTA_STDERR_MARKERS: [&str; 2] = ["resource_exhausted", "quota"];

#[derive(Debug)]
pub enum Admission {
    /// Proceed; a video-generation permit is attached when one was taken.
    Admit(Option<KlingPermit>),
    /// The gate refused; the task must go back to its prior runnable
    /// status without any external call.
    Release { reason: String },
}

/// RAII slot on the video-generation ceiling. Dropping it, on success or
/// failure alike, frees the slot.
#[derive(Debug)]
pub struct KlingPermit {
    count: Arc<AtomicU32>,
}

impl Drop for KlingPermit {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerGate {
    store: TaskStore,
    quota_tz: FixedOffset,
    kling_default_ceiling: u32,
    kling_in_flight: Arc<AtomicU32>,
    gemini_exhausted_until: Mutex<Option<DateTime<Utc>>>,
    alert_last_sent: Mutex<HashMap<(String, u32), Instant>>,
    alert_webhook: Option<String>,
    http: reqwest::Client,
}

impl WorkerGate {
    pub fn new(
        store: TaskStore,
        quota_tz: FixedOffset,
        kling_default_ceiling: u32,
        alert_webhook: Option<String>,
    ) -> Self {
        Self {
            store,
            quota_tz,
            kling_default_ceiling,
            kling_in_flight: Arc::new(AtomicU32::new(0)),
            gemini_exhausted_until: Mutex::new(None),
            alert_last_sent: Mutex::new(HashMap::new()),
            alert_webhook,
            http: reqwest::Client::new(),
        }
    }

    /// Today in the quota timezone. YouTube resets budgets at midnight
    /// Pacific, so the counter day must follow that clock, not UTC.
    pub fn quota_day(&self, now: DateTime<Utc>) -> chrono::NaiveDate {
        now.with_timezone(&self.quota_tz).date_naive()
    }

    pub async fn admit(&self, task: &Task, channel: &Channel) -> anyhow::Result<Admission> {
        match task.status {
            TaskStatus::Uploading => self.admit_upload(task, channel).await,
            TaskStatus::Claimed | TaskStatus::GeneratingAssets => Ok(self.admit_assets()),
            TaskStatus::GeneratingVideo => Ok(self.admit_video(channel)),
            _ => Ok(Admission::Admit(None)),
        }
    }

    async fn admit_upload(&self, task: &Task, channel: &Channel) -> anyhow::Result<Admission> {
        let day = self.quota_day(Utc::now());
        let usage = self.store.quota_get(&channel.id, day).await?;

        self.check_thresholds(&channel.id, usage.units_used, usage.daily_limit)
            .await;

        if !upload_admissible(usage.units_used, usage.daily_limit) {
            let task_id = task.id.to_string();
            let detail = format!("{}/{} units used", usage.units_used, usage.daily_limit);
            emit_event(
                Level::WARN,
                ProcessKind::Worker,
                ObservabilityEvent {
                    event: "gate.quota.release",
                    component: "worker.gate",
                    task_id: Some(&task_id),
                    channel_id: Some(&channel.id),
                    stage: Some("upload"),
                    status: Some(task.status.as_str()),
                    error_code: Some("quota_exhausted"),
                    detail: Some(&detail),
                },
            );
            return Ok(Admission::Release {
                reason: format!("youtube quota exhausted: {detail}"),
            });
        }
        Ok(Admission::Admit(None))
    }

    fn admit_assets(&self) -> Admission {
        let until = *self.gemini_exhausted_until.lock().expect("gate lock");
        match until {
            Some(until) if Utc::now() < until => Admission::Release {
                reason: format!("image generation quota exhausted until {until}"),
            },
            _ => Admission::Admit(None),
        }
    }

    fn admit_video(&self, channel: &Channel) -> Admission {
        let ceiling = channel
            .kling_concurrency
            .unwrap_or(self.kling_default_ceiling)
            .max(1);

        let mut current = self.kling_in_flight.load(Ordering::SeqCst);
        loop {
            if current >= ceiling {
                return Admission::Release {
                    reason: format!("video generation ceiling reached ({current}/{ceiling})"),
                };
            }
            match self.kling_in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Admission::Admit(Some(KlingPermit {
                        count: self.kling_in_flight.clone(),
                    }))
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Raise the exhaustion flag until the next midnight in the quota
    /// timezone. Asset claims are released without a call while it is up.
    pub fn mark_gemini_exhausted(&self, now: DateTime<Utc>) {
        let until = next_midnight(now, self.quota_tz);
        info!(until = %until, "image generation flagged exhausted");
        *self.gemini_exhausted_until.lock().expect("gate lock") = Some(until);
    }

    pub fn gemini_exhausted(&self, now: DateTime<Utc>) -> bool {
        matches!(
            *self.gemini_exhausted_until.lock().expect("gate lock"),
            Some(until) if now < until
        )
    }

    /// Record the post-upload unit spend and re-check alert thresholds.
    pub async fn record_upload(&self, channel_id: &str) -> anyhow::Result<()> {
        let day = self.quota_day(Utc::now());
        self.store.quota_add(channel_id, day, UPLOAD_COST_UNITS).await?;
        let usage = self.store.quota_get(channel_id, day).await?;
        self.check_thresholds(channel_id, usage.units_used, usage.daily_limit)
            .await;
        Ok(())
    }

    async fn check_thresholds(&self, channel_id: &str, units_used: i64, daily_limit: i64) {
        for threshold in ALERT_THRESHOLDS {
            if (units_used as f64) < threshold * daily_limit as f64 {
                continue;
            }
            let pct = (threshold * 100.0) as u32;
            if !self.should_alert(channel_id, pct) {
                continue;
            }
            let detail = format!("{units_used}/{daily_limit} units, {pct}% threshold crossed");
            emit_event(
                Level::WARN,
                ProcessKind::Worker,
                ObservabilityEvent {
                    event: "gate.quota.threshold",
                    component: "worker.gate",
                    task_id: None,
                    channel_id: Some(channel_id),
                    stage: Some("upload"),
                    status: None,
                    error_code: None,
                    detail: Some(&detail),
                },
            );
            if let Some(url) = &self.alert_webhook {
                let body = serde_json::json!({
                    "kind": "youtube_quota_threshold",
                    "channel_id": channel_id,
                    "threshold_pct": pct,
                    "units_used": units_used,
                    "daily_limit": daily_limit,
                });
                if let Err(e) = self.http.post(url).json(&body).send().await {
                    warn!(error = %e, "alert webhook delivery failed");
                }
            }
        }
    }

    /// At most one alert per (channel, threshold) per five minutes.
    fn should_alert(&self, channel_id: &str, threshold_pct: u32) -> bool {
        let mut last = self.alert_last_sent.lock().expect("gate lock");
        let key = (channel_id.to_string(), threshold_pct);
        let now = Instant::now();
        match last.get(&key) {
            Some(sent) if now.duration_since(*sent) < ALERT_THROTTLE => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    pub fn kling_in_flight(&self) -> u32 {
        self.kling_in_flight.load(Ordering::SeqCst)
    }
}

/// Midnight after `now` in the given offset, as a UTC instant.
fn next_midnight(now: DateTime<Utc>, tz: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let next_day = local.date_naive() + chrono::Duration::days(1);
    let midnight = next_day.and_hms_opt(0, 0, 0).expect("midnight");
    tz.from_local_datetime(&midnight)
        .single()
        .expect("fixed offsets have no gaps")
        .with_timezone(&Utc)
}

/// Whether one more upload fits the budget.
pub fn upload_admissible(units_used: i64, daily_limit: i64) -> bool {
    units_used + UPLOAD_COST_UNITS <= daily_limit
}
