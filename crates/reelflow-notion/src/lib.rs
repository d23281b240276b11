//! Client for the planning database's REST API.
//!
//! All calls go through one process-wide rolling-window rate limiter and a
//! shared retry schedule. Page ids are normalized to the canonical 32-char
//! hex form before they touch the wire. Callers never hold a database
//! transaction across any of these calls.

mod limiter;
pub mod page;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

pub use limiter::RateLimiter;

const NOTION_API: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum NotionError {
    #[error("invalid page id `{0}`")]
    InvalidPageId(String),

    #[error("page not found: {0}")]
    NotFound(String),

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl NotionError {
    pub fn is_retriable(&self) -> bool {
        match self {
            NotionError::RateLimited { .. } | NotionError::Http(_) => true,
            NotionError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Normalize a planning page id to 32 lowercase hex chars. Accepts the
/// dashed 36-char form and the bare 32-char form; idempotent.
pub fn normalize_page_id(raw: &str) -> Result<String, NotionError> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if compact.len() == 32 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(compact)
    } else {
        Err(NotionError::InvalidPageId(raw.to_string()))
    }
}

/// Delay before retry `attempt` (1-based): 1s, 2s, 4s, ... capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.saturating_sub(1).min(6);
    Duration::from_secs(secs).min(BACKOFF_CAP)
}

#[derive(Clone)]
pub struct NotionClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl NotionClient {
    pub fn new(token: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            base_url: NOTION_API.to_string(),
            limiter,
        }
    }

    #[doc(hidden)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn get_page(&self, page_id: &str) -> Result<Value, NotionError> {
        let id = normalize_page_id(page_id)?;
        let url = format!("{}/pages/{}", self.base_url, id);
        self.request(|| self.client.get(&url), &id).await
    }

    /// Patch page properties. Only the properties in `properties` are
    /// touched; everything else on the page is preserved.
    pub async fn update_page(
        &self,
        page_id: &str,
        properties: Value,
    ) -> Result<Value, NotionError> {
        let id = normalize_page_id(page_id)?;
        let url = format!("{}/pages/{}", self.base_url, id);
        let body = json!({ "properties": properties });
        self.request(|| self.client.patch(&url).json(&body), &id).await
    }

    pub async fn query_database(
        &self,
        database_id: &str,
        filter: Option<Value>,
    ) -> Result<Value, NotionError> {
        let id = normalize_page_id(database_id)?;
        let url = format!("{}/databases/{}/query", self.base_url, id);
        let body = match filter {
            Some(filter) => json!({ "filter": filter }),
            None => json!({}),
        };
        self.request(|| self.client.post(&url).json(&body), &id).await
    }

    async fn request<F>(&self, build: F, id: &str) -> Result<Value, NotionError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let response = build()
                .bearer_auth(&self.token)
                .header("Notion-Version", NOTION_VERSION)
                .send()
                .await;

            let retriable_status = match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(NotionError::NotFound(id.to_string()));
                    }
                    let message = response.text().await.unwrap_or_default();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        status.as_u16()
                    } else {
                        return Err(NotionError::Api {
                            status: status.as_u16(),
                            message,
                        });
                    }
                }
                // Connection-level failures retry on the same schedule.
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(id, attempt, error = %e, "planning request failed, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
                Err(e) => return Err(NotionError::Http(e)),
            };

            if attempt >= MAX_ATTEMPTS {
                return if retriable_status == 429 {
                    Err(NotionError::RateLimited { attempts: attempt })
                } else {
                    Err(NotionError::Api {
                        status: retriable_status,
                        message: "retries exhausted".to_string(),
                    })
                };
            }
            let delay = backoff_delay(attempt);
            warn!(id, attempt, status = retriable_status, delay_secs = delay.as_secs(), "planning request retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_accepts_both_forms() {
        let dashed = "1a2b3c4d-5e6f-7a8b-9c0d-1e2f3a4b5c6d";
        let bare = "1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d";
        assert_eq!(normalize_page_id(dashed).expect("dashed"), bare);
        assert_eq!(normalize_page_id(bare).expect("bare"), bare);
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_page_id("1A2B3C4D-5E6F-7A8B-9C0D-1E2F3A4B5C6D").expect("once");
        let twice = normalize_page_id(&once).expect("twice");
        assert_eq!(once, twice);
    }

    #[test]
    fn normalization_rejects_garbage() {
        for bad in ["", "short", "zz2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d", "1234"] {
            assert!(normalize_page_id(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(12), Duration::from_secs(60));
    }
}
