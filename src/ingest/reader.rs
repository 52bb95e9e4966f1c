use crate::checkpoint::{CheckpointStore, TableCheckpoint};
use crate::config::LiveIndexConfig;
use crate::error::LiveIndexError;
use crate::ingest::IngestTarget;
use crate::ingest::bootstrap::{BootstrapOutcome, bootstrap};
use crate::ingest::event::LogPosition;
use crate::ingest::source::{ChangeSource, TransactionStream};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a running change stream reader.
#[derive(Debug)]
pub struct ReaderHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the reader to stop and waits for it. The table keeps serving
    /// its last state.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "change stream reader task failed");
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.task.abort_handle()
    }
}

/// Starts the per-table reader: restore from a checkpoint or bootstrap,
/// then follow the change stream until shut down.
pub fn spawn_reader(
    target: IngestTarget,
    source: Arc<dyn ChangeSource>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    config: LiveIndexConfig,
) -> ReaderHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reader = ChangeStreamReader {
        target,
        source,
        checkpoints,
        config,
        shutdown: shutdown_rx,
        needs_snapshot: true,
        attempt: 0,
        since_checkpoint: 0,
    };
    ReaderHandle {
        shutdown: shutdown_tx,
        task: tokio::spawn(reader.run()),
    }
}

struct ChangeStreamReader {
    target: IngestTarget,
    source: Arc<dyn ChangeSource>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    config: LiveIndexConfig,
    shutdown: watch::Receiver<bool>,
    needs_snapshot: bool,
    attempt: u32,
    since_checkpoint: u64,
}

impl ChangeStreamReader {
    fn table(&self) -> String {
        self.target.table().to_string()
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self) {
        let table = self.table();
        match self.restore().await {
            Ok(restored) => self.needs_snapshot = !restored,
            Err(e) => warn!(table = %table, error = %e, "checkpoint restore failed; re-snapshotting"),
        }

        while !self.stopping() {
            let err = match self.cycle().await {
                Ok(()) => break,
                Err(e) => e,
            };
            if let LiveIndexError::ConsistencyViolation { .. } = &err {
                error!(table = %table, error = %err, "change stream went backwards; re-snapshotting");
                self.needs_snapshot = true;
            }
            self.attempt = self.attempt.saturating_add(1);
            self.target.status.mark_stalled(err.to_string(), self.attempt);
            if !self.config.retry.should_retry(self.attempt) {
                error!(table = %table, attempts = self.attempt, "giving up on change source");
                break;
            }
            let delay = self.config.retry.delay_for_attempt(self.attempt);
            info!(
                table = %table,
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                "retry scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!(table = %table, position = self.target.store.position().get(), "change stream reader stopped");
    }

    async fn restore(&mut self) -> Result<bool, LiveIndexError> {
        let Some(store) = self.checkpoints.clone() else {
            return Ok(false);
        };
        let table = self.table();
        let loaded = tokio::task::spawn_blocking({
            let table = table.clone();
            move || store.load(&table)
        })
        .await
        .map_err(|e| LiveIndexError::Checkpoint(e.to_string()))??;
        let Some(checkpoint) = loaded else {
            return Ok(false);
        };
        if !checkpoint.matches(self.target.store.descriptor()) {
            warn!(table = %table, "checkpoint was taken under another configuration; ignoring it");
            return Ok(false);
        }
        let rows = checkpoint.rows.len();
        self.target.restore(checkpoint.rows, checkpoint.position);
        self.target.status.mark_ready(checkpoint.position);
        info!(table = %table, rows, position = checkpoint.position.get(), "restored from checkpoint");
        Ok(true)
    }

    /// One connection's worth of work. `Ok` means shutdown was requested.
    async fn cycle(&mut self) -> Result<(), LiveIndexError> {
        let table = self.table();
        let (stream, delivered) = if self.needs_snapshot {
            let outcome = bootstrap(
                &self.target,
                self.source.as_ref(),
                self.config.snapshot_batch_size,
                &mut self.shutdown,
            )
            .await?;
            match outcome {
                BootstrapOutcome::Interrupted => return Ok(()),
                BootstrapOutcome::Completed { position, stream } => {
                    self.needs_snapshot = false;
                    self.checkpoint().await;
                    (stream, position)
                }
            }
        } else {
            let from = self.target.store.position();
            let stream = self
                .source
                .subscribe(&table, from)
                .await
                .map_err(|e| e.into_error(&table))?;
            self.target.status.mark_ready(from);
            (stream, from)
        };
        self.attempt = 0;
        self.follow(stream, delivered).await
    }

    async fn follow(
        &mut self,
        mut stream: TransactionStream,
        mut delivered: LogPosition,
    ) -> Result<(), LiveIndexError> {
        let table = self.table();
        loop {
            let next = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.stopping() {
                        return Ok(());
                    }
                    continue;
                }
                next = stream.recv() => next,
            };
            let txn = match next {
                None => {
                    return Err(LiveIndexError::Source {
                        table,
                        message: "change stream closed".into(),
                    });
                }
                Some(Err(e)) => return Err(e.into_error(&table)),
                Some(Ok(txn)) => txn,
            };
            if txn.position < delivered {
                return Err(LiveIndexError::ConsistencyViolation {
                    table,
                    message: format!(
                        "position {} delivered after {}",
                        txn.position, delivered
                    ),
                });
            }
            delivered = txn.position;
            if self.target.apply(&txn)?.is_none() {
                continue;
            }
            self.since_checkpoint += 1;
            let cadence = self.config.checkpoint_every_transactions;
            if cadence > 0 && self.since_checkpoint >= cadence {
                self.checkpoint().await;
            }
        }
    }

    /// Best effort: a failed checkpoint only delays the next resume point.
    async fn checkpoint(&mut self) {
        let Some(store) = self.checkpoints.clone() else {
            return;
        };
        let table = self.table();
        let snapshot = self.target.store.head();
        let position = snapshot.position;
        let saved = tokio::task::spawn_blocking(move || store.save(&TableCheckpoint::capture(&snapshot)))
            .await
            .map_err(|e| LiveIndexError::Checkpoint(e.to_string()))
            .and_then(|r| r);
        if let Err(e) = saved {
            warn!(table = %table, error = %e, "checkpoint failed");
            return;
        }
        self.since_checkpoint = 0;
        match self.source.acknowledge(&table, position).await {
            Ok(()) => debug!(table = %table, position = position.get(), "position acknowledged"),
            Err(e) => warn!(table = %table, error = %e, "acknowledge failed"),
        }
    }
}
