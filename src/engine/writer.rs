//! Write queue - ordered, awaitable write-through to the storage adapter
//!
//! Container listeners run synchronously, so they cannot await a storage
//! write. They push [`WriteCommand::Write`] onto an unbounded channel
//! instead; a single worker task applies writes in order.
//!
//! Callers that need durability use [`WriteQueue::flush`], which resolves
//! once every write enqueued before it has been attempted. Failed writes
//! are logged and counted, never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

use crate::error::{PersistError, Result};
use crate::storage::{Envelope, StorageAdapter};

/// Commands consumed by the writer task.
#[derive(Debug)]
enum WriteCommand {
    /// Persist an envelope under a key.
    Write { key: String, envelope: Envelope },
    /// Acknowledge once all previous writes were attempted.
    Flush(oneshot::Sender<()>),
    /// Drain pending writes, acknowledge, then stop.
    Shutdown(oneshot::Sender<()>),
}

/// Counters reported by [`WriteQueue::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
}

struct WriteWorker {
    adapter: Arc<dyn StorageAdapter>,
    command_rx: mpsc::UnboundedReceiver<WriteCommand>,
    counters: Arc<Counters>,
}

impl WriteWorker {
    async fn run(mut self) {
        debug!("Write queue started");

        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                WriteCommand::Write { key, envelope } => self.write(&key, envelope).await,
                WriteCommand::Flush(ack) => {
                    trace!("Flush acknowledged");
                    let _ = ack.send(());
                }
                WriteCommand::Shutdown(ack) => {
                    self.command_rx.close();
                    while let Ok(cmd) = self.command_rx.try_recv() {
                        match cmd {
                            WriteCommand::Write { key, envelope } => self.write(&key, envelope).await,
                            WriteCommand::Flush(ack) | WriteCommand::Shutdown(ack) => {
                                let _ = ack.send(());
                            }
                        }
                    }
                    info!(
                        "Write queue shut down (writes: {}, failures: {})",
                        self.counters.written.load(Ordering::Relaxed),
                        self.counters.failed.load(Ordering::Relaxed)
                    );
                    let _ = ack.send(());
                    return;
                }
            }
        }

        debug!("Write queue closed: engine dropped");
    }

    async fn write(&self, key: &str, envelope: Envelope) {
        match self.adapter.set(key, envelope).await {
            Ok(()) => {
                let n = self.counters.written.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Persisted '{}' (write #{})", key, n);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Failed to persist '{}': {}", key, e);
            }
        }
    }
}

/// Handle to the writer task.
pub(crate) struct WriteQueue {
    cmd_tx: mpsc::UnboundedSender<WriteCommand>,
    counters: Arc<Counters>,
}

impl WriteQueue {
    /// Spawn the writer task on the current Tokio runtime.
    pub(crate) fn spawn(adapter: Arc<dyn StorageAdapter>) -> Self {
        let (cmd_tx, command_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let worker = WriteWorker {
            adapter,
            command_rx,
            counters: counters.clone(),
        };
        tokio::spawn(worker.run());

        Self { cmd_tx, counters }
    }

    /// Queue a write without waiting for it.
    pub(crate) fn enqueue(&self, key: String, envelope: Envelope) -> Result<()> {
        self.cmd_tx
            .send(WriteCommand::Write { key, envelope })
            .map_err(|_| PersistError::WriteQueueClosed)
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WriteCommand::Flush(tx))
            .map_err(|_| PersistError::WriteQueueClosed)?;
        rx.await.map_err(|_| PersistError::WriteQueueClosed)
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WriteCommand::Shutdown(tx))
            .map_err(|_| PersistError::WriteQueueClosed)?;
        rx.await.map_err(|_| PersistError::WriteQueueClosed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub(crate) fn stats(&self) -> WriteStats {
        WriteStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
