use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::manager::Manager;
use crate::manifest::Attachment;
use crate::splitter::FixedSizeSplitter;
use crate::{Error, Result};

/// Invoked once per confirmed chunk, in ascending index order. Boxed rather
/// than generic because both writer variants share one enum and the caller
/// supplies the closure at `Manager::new_writer` time.
pub type OnChunk = Box<dyn FnMut(Attachment) + Send>;

/// A byte sink that splits an arbitrary write stream into fixed-size chunks
/// and uploads each through a `Manager`. The sequential variant keeps one
/// upload in flight; the parallel variant fans out across the pool.
pub enum ChunkWriter {
    Sequential(Box<SequentialChunkWriter>),
    Parallel(Box<ParallelChunkWriter>),
}

impl ChunkWriter {
    pub(crate) fn sequential(manager: Arc<Manager>, chunk_size: u64, on_chunk: OnChunk) -> Self {
        ChunkWriter::Sequential(Box::new(SequentialChunkWriter::new(
            manager, chunk_size, on_chunk,
        )))
    }

    pub(crate) fn parallel(manager: Arc<Manager>, chunk_size: u64, on_chunk: OnChunk) -> Self {
        ChunkWriter::Parallel(Box::new(ParallelChunkWriter::new(
            manager, chunk_size, on_chunk,
        )))
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            ChunkWriter::Sequential(w) => w.write(buf).await,
            ChunkWriter::Parallel(w) => w.write(buf).await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            ChunkWriter::Sequential(w) => w.close().await,
            ChunkWriter::Parallel(w) => w.close().await,
        }
    }
}

struct Inflight {
    write_half: tokio::io::DuplexStream,
    result_rx: oneshot::Receiver<Result<Attachment>>,
}

/// One upload in flight at a time, fed through an internal pipe so the
/// caller's `write` backpressures against upload speed rather than buffering
/// unboundedly.
pub struct SequentialChunkWriter {
    manager: Arc<Manager>,
    chunk_size: u64,
    on_chunk: OnChunk,
    next_index: u32,
    offset: u64,
    inflight: Option<Inflight>,
    closed: bool,
    poisoned: Option<Arc<Error>>,
}

impl SequentialChunkWriter {
    fn new(manager: Arc<Manager>, chunk_size: u64, on_chunk: OnChunk) -> Self {
        Self {
            manager,
            chunk_size,
            on_chunk,
            next_index: 0,
            offset: 0,
            inflight: None,
            closed: false,
            poisoned: None,
        }
    }

    fn start_upload(&mut self) {
        let (write_half, mut read_half) = tokio::io::duplex(self.chunk_size as usize);
        let manager = Arc::clone(&self.manager);
        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut body = Vec::new();
            let result = match read_half.read_to_end(&mut body).await {
                Ok(_) => manager.write(body).await,
                Err(e) => Err(Error::from(e)),
            };
            let _ = result_tx.send(result);
        });
        self.inflight = Some(Inflight {
            write_half,
            result_rx,
        });
    }

    fn poison(&mut self, e: Error) -> Error {
        warn!(event = "chunk_writer.poisoned", index = self.next_index, error = %e, "chunk_writer.poisoned");
        let arc = Arc::new(e);
        self.poisoned = Some(Arc::clone(&arc));
        Error::Poisoned(arc)
    }

    fn poison_check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if let Some(arc) = &self.poisoned {
            return Err(Error::Poisoned(Arc::clone(arc)));
        }
        Ok(())
    }

    async fn write_into_pipe(&mut self, buf: &[u8]) -> Result<()> {
        let write_res = {
            let inflight = self
                .inflight
                .as_mut()
                .expect("start_upload always precedes write_into_pipe");
            inflight.write_half.write_all(buf).await
        };
        if let Err(e) = write_res {
            let inflight = self.inflight.take().expect("checked above");
            let cause = match inflight.result_rx.await {
                Ok(Err(upload_err)) => upload_err,
                _ => Error::Io(e),
            };
            return Err(self.poison(cause));
        }
        Ok(())
    }

    /// Closes the pipe's write end, waits for the upload result, and emits
    /// the confirmed chunk via `on_chunk`. If `start_next`, a fresh upload is
    /// armed immediately so the next `write` call has somewhere to go.
    async fn flush(&mut self, start_next: bool) -> Result<()> {
        let inflight = self
            .inflight
            .take()
            .expect("flush is only called while an upload is in flight");
        drop(inflight.write_half);
        let result = inflight
            .result_rx
            .await
            .unwrap_or_else(|_| Err(Error::Closed));
        match result {
            Ok(attachment) => {
                let attachment = Attachment {
                    index: self.next_index,
                    ..attachment
                };
                self.next_index += 1;
                self.offset = 0;
                (self.on_chunk)(attachment);
                if start_next {
                    self.start_upload();
                }
                Ok(())
            }
            Err(e) => Err(self.poison(e)),
        }
    }

    pub async fn write(&mut self, mut p: &[u8]) -> Result<()> {
        self.poison_check()?;
        while !p.is_empty() {
            if self.inflight.is_none() {
                self.start_upload();
            }
            let room = (self.chunk_size - self.offset) as usize;
            if p.len() > room {
                self.write_into_pipe(&p[..room]).await?;
                p = &p[room..];
                self.flush(true).await?;
            } else {
                self.write_into_pipe(p).await?;
                self.offset += p.len() as u64;
                p = &[];
            }
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if let Some(arc) = &self.poisoned {
            self.closed = true;
            return Err(Error::Poisoned(Arc::clone(arc)));
        }
        self.closed = true;
        if self.inflight.is_none() && self.next_index == 0 {
            // Never written to: per the documented zero-byte policy, close
            // still produces exactly one size=0 attachment.
            self.start_upload();
        }
        if self.inflight.is_some() {
            self.flush(false).await?;
        }
        Ok(())
    }
}

/// Up to `pool_size` uploads in flight at once. A splitter assigns
/// each buffer a monotonic index; a fixed worker pool drains a bounded
/// channel (capacity = pool size, bounding memory at `N * chunk_size`);
/// results are sorted and emitted in index order on close.
pub struct ParallelChunkWriter {
    on_chunk: OnChunk,
    splitter: FixedSizeSplitter,
    tx: Option<mpsc::Sender<(u32, Vec<u8>)>>,
    workers: Option<FuturesUnordered<tokio::task::JoinHandle<()>>>,
    results: Arc<Mutex<Vec<(u32, Attachment)>>>,
    first_error: Arc<Mutex<Option<Arc<Error>>>>,
    cancel: CancellationToken,
    any_dispatched: bool,
    closed: bool,
}

impl ParallelChunkWriter {
    fn new(manager: Arc<Manager>, chunk_size: u64, on_chunk: OnChunk) -> Self {
        let pool_size = manager.pool_size().max(1);
        let (tx, rx) = mpsc::channel::<(u32, Vec<u8>)>(pool_size);
        let rx = Arc::new(Mutex::new(rx));
        let results = Arc::new(Mutex::new(Vec::new()));
        let first_error: Arc<Mutex<Option<Arc<Error>>>> = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let workers = FuturesUnordered::new();
        for _ in 0..pool_size {
            let rx = Arc::clone(&rx);
            let manager = Arc::clone(&manager);
            let results = Arc::clone(&results);
            let first_error = Arc::clone(&first_error);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = cancel.cancelled() => break,
                        job = async { rx.lock().await.recv().await } => job,
                    };
                    let Some((index, body)) = job else {
                        break;
                    };
                    if cancel.is_cancelled() {
                        break;
                    }
                    match manager.write(body).await {
                        Ok(attachment) => {
                            let attachment = Attachment { index, ..attachment };
                            results.lock().await.push((index, attachment));
                        }
                        Err(e) => {
                            let mut guard = first_error.lock().await;
                            if guard.is_none() {
                                warn!(event = "chunk_writer.poisoned", index, error = %e, "chunk_writer.poisoned");
                                *guard = Some(Arc::new(e));
                            }
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }));
        }

        Self {
            on_chunk,
            splitter: FixedSizeSplitter::new(chunk_size as usize),
            tx: Some(tx),
            workers: Some(workers),
            results,
            first_error,
            cancel,
            any_dispatched: false,
            closed: false,
        }
    }

    async fn poisoned(&self) -> Option<Arc<Error>> {
        self.first_error.lock().await.clone()
    }

    async fn dispatch(&mut self, index: u32, buf: Vec<u8>) -> Result<()> {
        self.any_dispatched = true;
        let tx = self
            .tx
            .as_ref()
            .expect("dispatch is never called after close takes the sender");
        tokio::select! {
            send_res = tx.send((index, buf)) => {
                if send_res.is_err() {
                    if let Some(arc) = self.poisoned().await {
                        return Err(Error::Poisoned(arc));
                    }
                    return Err(Error::Closed);
                }
                Ok(())
            }
            _ = self.cancel.cancelled() => {
                if let Some(arc) = self.poisoned().await {
                    Err(Error::Poisoned(arc))
                } else {
                    Err(Error::Cancelled)
                }
            }
        }
    }

    pub async fn write(&mut self, p: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if let Some(arc) = self.poisoned().await {
            return Err(Error::Poisoned(arc));
        }
        let jobs = self.splitter.feed(p);
        for (index, buf) in jobs {
            self.dispatch(index, buf).await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.closed = true;

        if let Some((index, buf)) = self.splitter.finish() {
            // Ignore the dispatch error here; if it failed the pool is
            // already poisoned or cancelled and we surface that below.
            let _ = self.dispatch(index, buf).await;
        }
        if !self.any_dispatched {
            let _ = self.dispatch(0, Vec::new()).await;
        }

        if let Some(tx) = self.tx.take() {
            drop(tx);
        }
        if let Some(mut workers) = self.workers.take() {
            while workers.next().await.is_some() {}
        }

        if let Some(arc) = self.poisoned().await {
            return Err(Error::Poisoned(arc));
        }

        let mut results = std::mem::take(&mut *self.results.lock().await);
        results.sort_by_key(|(idx, _)| *idx);
        for (_, attachment) in results {
            (self.on_chunk)(attachment);
        }
        Ok(())
    }
}
