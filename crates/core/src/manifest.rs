use crate::{Error, Result};

/// An immutable reference to one fixed-size slice of a blob, stored as a
/// single webhook message's file attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub size: u64,
    pub index: u32,
}

/// The ordered list of attachments reconstructing one blob.
///
/// Indices must be the dense sequence `0..n-1`; `Manifest::new` rejects
/// anything else, so every other method can assume the invariant holds.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    attachments: Vec<Attachment>,
}

impl Manifest {
    pub fn new(mut attachments: Vec<Attachment>) -> Result<Self> {
        attachments.sort_by_key(|a| a.index);
        for (expected, a) in attachments.iter().enumerate() {
            if a.index as usize != expected {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "manifest indices must be dense 0..n-1, got index={} at position {expected}",
                        a.index
                    ),
                });
            }
        }
        Ok(Self { attachments })
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.attachments.iter().map(|a| a.size).sum()
    }

    /// Half-open `[start, end)` byte ranges, one per attachment, in index order.
    pub fn offsets(&self) -> Vec<(u64, u64)> {
        let mut start = 0u64;
        self.attachments
            .iter()
            .map(|a| {
                let end = start + a.size;
                let range = (start, end);
                start = end;
                range
            })
            .collect()
    }

    /// Locate the attachment and local offset containing absolute byte `pos`.
    ///
    /// `pos < 0` is not representable in `u64`; callers with a signed offset
    /// must reject negatives before calling. `pos >= total_size` is `InvalidSeek`.
    pub fn locate(&self, pos: u64) -> Result<(usize, u64)> {
        let total = self.total_size();
        if pos >= total {
            return Err(Error::InvalidSeek { pos: pos as i64 });
        }
        let mut start = 0u64;
        for (idx, a) in self.attachments.iter().enumerate() {
            let end = start + a.size;
            if pos < end {
                return Ok((idx, pos - start));
            }
            start = end;
        }
        unreachable!("pos already validated to be < total_size")
    }
}

/// Parses an HTTP `Range: bytes=start-end` header value against a known
/// `total_size`. Both bounds are inclusive on success. Only the
/// single-range `bytes=a-b` / `bytes=a-` forms are accepted; suffix ranges
/// (`bytes=-N`) and multi-range requests are rejected as `InvalidRange`
/// rather than guessed at.
pub fn parse_range_header(header: &str, total_size: u64) -> Result<(u64, u64)> {
    let invalid = |message: String| Error::InvalidRange { message };

    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| invalid(format!("unsupported range unit: {header}")))?;
    if spec.contains(',') {
        return Err(invalid("multi-range requests are not supported".to_string()));
    }
    let (start_s, end_s) = spec
        .split_once('-')
        .ok_or_else(|| invalid(format!("malformed range: {header}")))?;
    if start_s.is_empty() {
        return Err(invalid("suffix ranges are not supported".to_string()));
    }
    let start: u64 = start_s
        .parse()
        .map_err(|_| invalid(format!("malformed range start: {start_s}")))?;
    let end: u64 = if end_s.is_empty() {
        total_size.saturating_sub(1)
    } else {
        end_s
            .parse()
            .map_err(|_| invalid(format!("malformed range end: {end_s}")))?
    };

    if total_size == 0 || start > end || end >= total_size {
        return Err(invalid(format!(
            "range {start}-{end} unsatisfiable for size {total_size}"
        )));
    }
    Ok((start, end))
}
