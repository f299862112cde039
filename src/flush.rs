/// Debounced writes of per-record state
///
/// Edits are collected in memory and written as one batch once no new edit
/// has arrived for the quiescence window. Repeated edits of the same
/// `(id, key)` collapse to the latest value.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::catalog::{LazyCache, RecordState};
use crate::error::CacheError;

/// Destination of flushed batches.
pub trait StateSink: Send + Sync + 'static {
    fn write_batch(&self, batch: &[RecordState]) -> Result<(), CacheError>;
}

impl StateSink for LazyCache {
    fn write_batch(&self, batch: &[RecordState]) -> Result<(), CacheError> {
        self.with_cache(|cache| cache.store_record_state(batch))
    }
}

enum Command {
    Record(RecordState),
    Flush(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<usize>),
}

type Pending = BTreeMap<(String, String), RecordState>;

/// Owner of the background flush task.
pub struct DebouncedWriter {
    tx: mpsc::UnboundedSender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    quiescence: Duration,
}

impl DebouncedWriter {
    /// Start the flush task. Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn StateSink>, quiescence: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(sink, rx, quiescence));
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            quiescence,
        }
    }

    pub fn quiescence(&self) -> Duration {
        self.quiescence
    }

    /// Queue an edit. Returns false once the writer has shut down.
    pub fn record(&self, state: RecordState) -> bool {
        self.tx.send(Command::Record(state)).is_ok()
    }

    /// Write everything pending now. Returns the number of records written.
    pub async fn flush_now(&self) -> usize {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Flush(reply)).is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }

    /// Drain pending edits and stop the task.
    pub async fn shutdown(&self) -> usize {
        let (reply, done) = oneshot::channel();
        let written = if self.tx.send(Command::Shutdown(reply)).is_ok() {
            done.await.unwrap_or(0)
        } else {
            0
        };

        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Flush task ended abnormally");
            }
        }
        written
    }
}

impl Drop for DebouncedWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

async fn run(sink: Arc<dyn StateSink>, mut rx: mpsc::UnboundedReceiver<Command>, quiescence: Duration) {
    let mut pending = Pending::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                _ = time::sleep_until(at) => {
                    deadline = None;
                    if flush(&sink, &mut pending).await.is_none() {
                        // Keep the edits and try again after another window
                        deadline = Some(Instant::now() + quiescence);
                    }
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Record(state)) => {
                pending.insert((state.id.clone(), state.key.clone()), state);
                deadline = Some(Instant::now() + quiescence);
            }
            Some(Command::Flush(reply)) => {
                deadline = None;
                let written = flush(&sink, &mut pending).await.unwrap_or(0);
                if !pending.is_empty() {
                    deadline = Some(Instant::now() + quiescence);
                }
                let _ = reply.send(written);
            }
            Some(Command::Shutdown(reply)) => {
                let written = flush(&sink, &mut pending).await.unwrap_or(0);
                if !pending.is_empty() {
                    warn!(dropped = pending.len(), "Discarding unwritten record state at shutdown");
                }
                let _ = reply.send(written);
                break;
            }
            None => {
                flush(&sink, &mut pending).await;
                break;
            }
        }
    }
    info!("Flush task stopped");
}

/// Write the pending batch. `None` on failure, with the batch retained.
async fn flush(sink: &Arc<dyn StateSink>, pending: &mut Pending) -> Option<usize> {
    if pending.is_empty() {
        return Some(0);
    }
    let batch: Vec<RecordState> = std::mem::take(pending).into_values().collect();
    let count = batch.len();

    let writer = Arc::clone(sink);
    let result = task::spawn_blocking(move || {
        let outcome = writer.write_batch(&batch);
        (batch, outcome)
    })
    .await;

    match result {
        Ok((_, Ok(()))) => {
            debug!(records = count, "Flushed record state");
            Some(count)
        }
        Ok((batch, Err(e))) => {
            warn!(records = count, error = %e, "Record state flush failed");
            for state in batch {
                // Edits that arrived meanwhile are newer
                pending.entry((state.id.clone(), state.key.clone())).or_insert(state);
            }
            None
        }
        Err(e) => {
            warn!(records = count, error = %e, "Record state flush task failed");
            None
        }
    }
}
