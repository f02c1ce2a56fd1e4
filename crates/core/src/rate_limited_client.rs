use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::manifest::Attachment;
use crate::{Error, Result};

static WEBHOOK_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://([A-Za-z0-9-]+\.)?discord\.com/api/webhooks/\d+/[A-Za-z0-9_-]+$")
        .expect("static webhook url regex is valid")
});

pub fn validate_webhook_url(url: &str) -> Result<()> {
    if WEBHOOK_URL_RE.is_match(url) {
        return Ok(());
    }
    #[cfg(feature = "test-support")]
    if url.starts_with("http://127.0.0.1:") && url.contains("/api/webhooks/") {
        return Ok(());
    }
    Err(Error::InvalidWebhook {
        message: format!("url does not match the webhook url form: {url}"),
    })
}

/// `(remaining, reset_at)` tracked per client from the webhook's own
/// rate-limit response headers, guarded so that concurrent uploads on the
/// same client observe a consistent view of the quota.
#[derive(Debug)]
struct RateLimitState {
    remaining: i64,
    reset_at: Option<DateTime<Utc>>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            remaining: i64::MAX,
            reset_at: None,
        }
    }
}

/// One instance wraps one webhook URL.
#[derive(Debug)]
pub struct RateLimitedClient {
    url: String,
    http: reqwest::Client,
    state: Mutex<RateLimitState>,
}

impl RateLimitedClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        validate_webhook_url(&url)?;
        Ok(Self {
            url,
            http: reqwest::Client::new(),
            state: Mutex::new(RateLimitState::default()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Blocks until the quota gate opens. The guard is scoped to the check
    /// and dropped before the sleep, so two concurrent `upload` calls on the
    /// same client can both read a stale `remaining == 0` and sleep
    /// independently rather than queueing behind one another; the wait is
    /// against the same `reset_at` either way, so both still clear the gate
    /// at the same time and the network call only ever runs after the wait.
    async fn wait_for_quota(&self) {
        let wait_until = {
            let guard = self.state.lock().await;
            if guard.remaining == 0 {
                guard.reset_at
            } else {
                None
            }
        };
        if let Some(reset_at) = wait_until {
            let now = Utc::now();
            if now < reset_at {
                let dur = (reset_at - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                debug!(
                    event = "webhook.rate_limit_wait",
                    url = %self.url,
                    wait_ms = dur.as_millis() as u64,
                    "webhook.rate_limit_wait"
                );
                sleep(dur).await;
            }
        }
    }

    /// Updates `(remaining, reset_at)` from response headers. Parse failures
    /// leave the field untouched, except `remaining` which is conservatively
    /// decremented by one when the header is missing entirely rather than
    /// trusted to still be accurate.
    async fn record_headers(&self, headers: &reqwest::header::HeaderMap) {
        let mut guard = self.state.lock().await;

        let remaining = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());
        match remaining {
            Some(v) => guard.remaining = v.max(0),
            None => guard.remaining = (guard.remaining - 1).max(0),
        }

        if let Some(secs) = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
        {
            guard.reset_at = Utc.timestamp_opt(secs, 0).single();
        }
    }

    /// Uploads `body` as the one part of a multipart/form-data request and
    /// returns the Attachment parsed from the response. `index` is not set
    /// here; the caller (ChunkWriter) assigns it.
    pub async fn upload(&self, body: Vec<u8>) -> Result<Attachment> {
        self.wait_for_quota().await;

        let token = uuid::Uuid::new_v4().simple().to_string();
        let part = reqwest::multipart::Part::bytes(body)
            .file_name(token.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| Error::Transport {
                message: format!("building multipart part failed: {e}"),
            })?;
        let form = reqwest::multipart::Form::new().part(token, part);

        let res = self.http.post(&self.url).multipart(form).send().await?;
        let headers = res.headers().clone();
        let status = res.status();
        let body_text = res.text().await?;

        self.record_headers(&headers).await;

        if !status.is_success() {
            warn!(
                event = "webhook.upload_failed",
                url = %self.url,
                status = status.as_u16(),
                "webhook.upload_failed"
            );
            return Err(Error::Remote {
                status: status.as_u16(),
            });
        }

        let parsed: WebhookResponse = serde_json::from_str(&body_text).map_err(|e| {
            Error::Malformed {
                message: format!("invalid webhook response json: {e}"),
            }
        })?;

        if parsed.attachments.len() != 1 {
            return Err(Error::Malformed {
                message: format!(
                    "expected exactly one attachment, got {}",
                    parsed.attachments.len()
                ),
            });
        }
        let attachment = parsed.attachments.into_iter().next().expect("len == 1");

        debug!(
            event = "webhook.upload_ok",
            url = %self.url,
            bytes = attachment.size,
            "webhook.upload_ok"
        );
        Ok(Attachment {
            url: attachment.url,
            size: attachment.size,
            index: 0,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    attachments: Vec<WebhookAttachment>,
}

#[derive(Debug, Deserialize)]
struct WebhookAttachment {
    url: String,
    size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_webhook_url() {
        validate_webhook_url("https://discord.com/api/webhooks/123456789012345678/abcDEF_123-xyz")
            .unwrap();
    }

    #[test]
    fn accepts_subdomain_webhook_url() {
        validate_webhook_url("https://canary.discord.com/api/webhooks/1/token").unwrap();
    }

    #[test]
    fn rejects_non_webhook_urls() {
        assert!(validate_webhook_url("https://discord.com/api/webhooks/abc/token").is_err());
        assert!(validate_webhook_url("http://discord.com/api/webhooks/1/token").is_err());
        assert!(validate_webhook_url("https://example.com/api/webhooks/1/token").is_err());
    }

    #[tokio::test]
    async fn construction_validates_url_eagerly() {
        let err = RateLimitedClient::new("https://example.com/nope").unwrap_err();
        assert!(matches!(err, Error::InvalidWebhook { .. }));
    }
}
