//! Pure buffer-accumulation logic shared by both chunk writers: feed in
//! arbitrary-sized slices, get back fixed-size buffers tagged with a
//! monotonically increasing index. No I/O, no async. The dispatch side
//! (pipe task or worker pool) lives in `chunk_writer`.

pub struct FixedSizeSplitter {
    chunk_size: usize,
    buf: Vec<u8>,
    next_index: u32,
}

impl FixedSizeSplitter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            buf: Vec::with_capacity(chunk_size),
            next_index: 0,
        }
    }

    /// Consumes `data`, returning every buffer that filled to `chunk_size`
    /// along the way. A buffer that exactly reaches `chunk_size` is emitted
    /// immediately only if more data follows in this call; an exact fill at
    /// the very end of `data` is held back so a blob whose length is a
    /// multiple of `chunk_size` does not spuriously emit a trailing
    /// zero-byte chunk.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<(u32, Vec<u8>)> {
        let mut out = Vec::new();
        while !data.is_empty() {
            let room = self.chunk_size - self.buf.len();
            if data.len() > room {
                self.buf.extend_from_slice(&data[..room]);
                data = &data[room..];
                out.push((self.next_index, std::mem::replace(
                    &mut self.buf,
                    Vec::with_capacity(self.chunk_size),
                )));
                self.next_index += 1;
            } else {
                self.buf.extend_from_slice(data);
                data = &[];
            }
        }
        out
    }

    /// Drains whatever is left in the current buffer, whether empty or
    /// partial. Returns `None` only when the buffer is empty, i.e. the last
    /// `feed` call left it exactly aligned on a chunk boundary (or nothing
    /// was ever fed).
    pub fn finish(&mut self) -> Option<(u32, Vec<u8>)> {
        if self.buf.is_empty() {
            return None;
        }
        let buf = std::mem::take(&mut self.buf);
        let index = self.next_index;
        self.next_index += 1;
        Some((index, buf))
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }
}
