use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::chunk_reader::ChunkReader;
use crate::chunk_writer::{ChunkWriter, OnChunk};
use crate::manifest::{Attachment, Manifest};
use crate::rate_limited_client::RateLimitedClient;
use crate::{Error, Result};

/// What `Manager::read_range` hands back to `ChunkReader`: an `AsyncRead`
/// over one ranged GET's body, boxed because its concrete stream type is not
/// nameable as a struct field.
pub type RangeBody = std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>;

/// Owns a pool of `RateLimitedClient`s and spreads load across them.
///
/// Round-robin is a single `AtomicUsize` cursor. There is no fairness
/// obligation across blobs and no health tracking of individual endpoints,
/// only load spreading.
pub struct Manager {
    clients: Vec<RateLimitedClient>,
    next: AtomicUsize,
    http: reqwest::Client,
}

impl Manager {
    pub fn new(clients: Vec<RateLimitedClient>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::InvalidConfig {
                message: "Manager requires at least one webhook client".to_string(),
            });
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            http: reqwest::Client::new(),
        })
    }

    pub fn from_webhook_urls(urls: &[String]) -> Result<Self> {
        let clients = urls
            .iter()
            .map(RateLimitedClient::new)
            .collect::<Result<Vec<_>>>()?;
        Self::new(clients)
    }

    pub fn pool_size(&self) -> usize {
        self.clients.len()
    }

    fn next_client(&self) -> &RateLimitedClient {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[idx]
    }

    /// Uploads one chunk body via the next client in the round-robin pool.
    /// The returned `Attachment.index` is always `0`; the writer assigns the
    /// real index.
    pub async fn write(&self, body: Vec<u8>) -> Result<Attachment> {
        self.next_client().upload(body).await
    }

    /// Issues a ranged GET against an attachment URL. `start`/`end` are both
    /// inclusive, matching the `Range: bytes=start-end` header contract.
    /// Any status other than 206 Partial Content is an error.
    pub async fn read_range(&self, url: &str, start: u64, end: u64) -> Result<RangeBody> {
        debug!(event = "webhook.range_get", url, start, end, "webhook.range_get");
        let res = self
            .http
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;

        if res.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::Remote {
                status: res.status().as_u16(),
            });
        }

        let stream = futures::TryStreamExt::map_err(
            res.bytes_stream(),
            io_error as fn(reqwest::Error) -> std::io::Error,
        );
        Ok(Box::pin(StreamReader::new(stream)))
    }

    /// Builds a writer for a new blob-write session. `parallel` selects the
    /// concurrent writer (pool-sized fan-out) over the sequential one,
    /// matching `Config::async_write`.
    pub fn new_writer(self: &Arc<Self>, chunk_size: u64, parallel: bool, on_chunk: OnChunk) -> Result<ChunkWriter> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig {
                message: "chunk_size must be > 0".to_string(),
            });
        }
        if parallel {
            Ok(ChunkWriter::parallel(Arc::clone(self), chunk_size, on_chunk))
        } else {
            Ok(ChunkWriter::sequential(Arc::clone(self), chunk_size, on_chunk))
        }
    }

    pub fn new_reader(self: &Arc<Self>, manifest: Manifest, pos: u64) -> Result<ChunkReader> {
        ChunkReader::new(Arc::clone(self), manifest, pos)
    }
}

fn io_error(e: reqwest::Error) -> std::io::Error {
    std::io::Error::other(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_pool() {
        assert!(Manager::new(Vec::new()).is_err());
    }

    #[test]
    fn rejects_malformed_webhook_urls() {
        let urls = vec!["https://example.com/nope".to_string()];
        assert!(Manager::from_webhook_urls(&urls).is_err());
    }

    #[tokio::test]
    async fn round_robins_across_pool() {
        let urls = (0..3)
            .map(|i| format!("https://discord.com/api/webhooks/{i}/token"))
            .collect::<Vec<_>>();
        let manager = Manager::from_webhook_urls(&urls).unwrap();
        assert_eq!(manager.pool_size(), 3);
        // next_client cycles modulo pool size; just exercise it doesn't panic.
        for _ in 0..7 {
            let _ = manager.next_client();
        }
    }
}
