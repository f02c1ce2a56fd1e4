use std::io::SeekFrom;
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use crate::manager::{Manager, RangeBody};
use crate::manifest::Manifest;
use crate::{Error, Result};

/// Presents `[pos, total_size)` of a blob as a contiguous byte stream,
/// opening ranged GETs against the manifest's attachments lazily and only
/// one chunk at a time.
pub struct ChunkReader {
    manager: Arc<Manager>,
    manifest: Manifest,
    pos: u64,
    current: Option<RangeBody>,
}

impl ChunkReader {
    pub(crate) fn new(manager: Arc<Manager>, manifest: Manifest, pos: u64) -> Result<Self> {
        if pos > manifest.total_size() {
            return Err(Error::InvalidSeek { pos: pos as i64 });
        }
        Ok(Self {
            manager,
            manifest,
            pos,
            current: None,
        })
    }

    async fn open_current(&mut self) -> Result<()> {
        let (idx, local_offset) = self.manifest.locate(self.pos)?;
        let attachment = &self.manifest.attachments()[idx];
        let end = attachment.size - 1;
        let stream = self
            .manager
            .read_range(&attachment.url, local_offset, end)
            .await?;
        self.current = Some(stream);
        Ok(())
    }

    /// Reads up to `buf.len()` bytes, returning `0` only at end of blob.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.pos >= self.manifest.total_size() {
                return Ok(0);
            }
            if self.current.is_none() {
                self.open_current().await?;
            }
            let stream = self.current.as_mut().expect("just opened above");
            match stream.read(buf).await {
                Ok(0) => {
                    // Current chunk's ranged GET body is exhausted; move on
                    // to the next chunk on the following iteration.
                    self.current = None;
                }
                Ok(n) => {
                    self.pos += n as u64;
                    return Ok(n);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Closes the active underlying stream (if any) and re-targets `pos`;
    /// the reader reinitializes lazily on the next `read`.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        let total = self.manifest.total_size() as i64;
        let new_pos = match from {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => total + delta,
        };
        if new_pos < 0 || new_pos as u64 > self.manifest.total_size() {
            return Err(Error::InvalidSeek { pos: new_pos });
        }
        self.pos = new_pos as u64;
        self.current = None;
        Ok(self.pos)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn total_size(&self) -> u64 {
        self.manifest.total_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Attachment;

    fn manager() -> Arc<Manager> {
        let urls = vec!["https://discord.com/api/webhooks/1/token".to_string()];
        Arc::new(Manager::from_webhook_urls(&urls).unwrap())
    }

    fn manifest() -> Manifest {
        Manifest::new(vec![
            Attachment {
                url: "https://example.invalid/0".to_string(),
                size: 4,
                index: 0,
            },
            Attachment {
                url: "https://example.invalid/1".to_string(),
                size: 2,
                index: 1,
            },
        ])
        .unwrap()
    }

    #[test]
    fn rejects_construction_past_end() {
        let err = ChunkReader::new(manager(), manifest(), 7).unwrap_err();
        assert!(matches!(err, Error::InvalidSeek { .. }));
    }

    #[test]
    fn allows_construction_exactly_at_eof() {
        ChunkReader::new(manager(), manifest(), 6).unwrap();
    }

    #[test]
    fn seek_rejects_out_of_range_targets() {
        let mut reader = ChunkReader::new(manager(), manifest(), 0).unwrap();
        assert!(reader.seek(SeekFrom::Start(7)).is_err());
        assert!(reader.seek(SeekFrom::Current(-1)).is_err());
        assert_eq!(reader.seek(SeekFrom::End(0)).unwrap(), 6);
    }

    #[test]
    fn current_seek_with_zero_delta_is_a_no_op() {
        let mut reader = ChunkReader::new(manager(), manifest(), 3).unwrap();
        assert_eq!(reader.seek(SeekFrom::Current(0)).unwrap(), 3);
        assert_eq!(reader.position(), 3);
    }
}
