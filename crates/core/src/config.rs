use serde::{Deserialize, Serialize};

use crate::rate_limited_client::validate_webhook_url;
use crate::{Error, Result};

/// Hard cap on `chunk_size`, per spec: a single chunk must fit in one
/// webhook attachment.
pub const CHUNK_SIZE_HARD_CAP: u64 = 25 * 1024 * 1024;

/// Configuration consumed by the core. Unlike the teacher's `SettingsV2`
/// (schedule, retention, Telegram-specific endpoints), this carries only the
/// fields the chunked blob engine itself reads; everything else (auth,
/// front-door protocol config) belongs to the adapters that embed this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chunk_size: u64,
    pub webhooks: Vec<String>,
    #[serde(default)]
    pub async_write: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig {
                message: "chunk_size must be > 0".to_string(),
            });
        }
        if self.chunk_size > CHUNK_SIZE_HARD_CAP {
            return Err(Error::InvalidConfig {
                message: format!(
                    "chunk_size {} exceeds hard cap {CHUNK_SIZE_HARD_CAP}",
                    self.chunk_size
                ),
            });
        }
        if self.webhooks.is_empty() {
            return Err(Error::InvalidConfig {
                message: "webhooks must be non-empty".to_string(),
            });
        }
        for url in &self.webhooks {
            validate_webhook_url(url)?;
        }
        Ok(())
    }
}
