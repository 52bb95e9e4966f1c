use crate::catalog::types::{RowImage, Value};
use crate::ingest::event::{ChangeEvent, LogPosition, Transaction};
use crate::ingest::source::{ChangeSource, SnapshotRead, SourceError, TransactionStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryTable {
    primary_key: String,
    rows: BTreeMap<Value, RowImage>,
    log: Vec<Transaction>,
    acknowledged: Option<LogPosition>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Fail the next snapshot after this many batches.
    snapshot_fail_after: Option<usize>,
    subscribe_failures: u32,
    batch_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    position: u64,
    faults: Faults,
}

/// In-process change source: a per-table commit log with a single global
/// position counter, plus fault injection for exercising reader recovery.
#[derive(Debug, Clone, Default)]
pub struct MemoryChangeSource {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    generation: Arc<AtomicU64>,
    channel_capacity: usize,
}

impl MemoryChangeSource {
    pub fn new() -> Self {
        Self {
            channel_capacity: 256,
            ..Self::default()
        }
    }

    pub fn create_table(&self, table: &str, primary_key: &str) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_insert_with(|| MemoryTable {
                primary_key: primary_key.to_string(),
                ..MemoryTable::default()
            });
    }

    /// Commits `events` as one transaction and returns its position.
    pub fn commit(&self, table: &str, events: Vec<ChangeEvent>) -> Result<LogPosition, SourceError> {
        let position = {
            let mut state = self.state.lock();
            let next = LogPosition(state.position + 1);
            let entry = state
                .tables
                .get_mut(table)
                .ok_or_else(|| SourceError::UnknownTable(table.to_string()))?;
            for event in &events {
                match event {
                    ChangeEvent::Insert { row } | ChangeEvent::Update { old_key: None, row } => {
                        let key = row.get(&entry.primary_key).cloned().unwrap_or(Value::Null);
                        entry.rows.insert(key, row.clone());
                    }
                    ChangeEvent::Update {
                        old_key: Some(old),
                        row,
                    } => {
                        entry.rows.remove(old.value());
                        let key = row.get(&entry.primary_key).cloned().unwrap_or(Value::Null);
                        entry.rows.insert(key, row.clone());
                    }
                    ChangeEvent::Delete { key } => {
                        entry.rows.remove(key.value());
                    }
                }
            }
            entry.log.push(Transaction::new(table, next, events));
            state.position = next.get();
            next
        };
        self.notify.notify_waiters();
        Ok(position)
    }

    /// Appends `txn` to the table's log verbatim, without touching snapshot
    /// state or the position counter.
    pub fn inject(&self, txn: Transaction) -> Result<(), SourceError> {
        {
            let mut state = self.state.lock();
            let entry = state
                .tables
                .get_mut(&txn.table)
                .ok_or_else(|| SourceError::UnknownTable(txn.table.clone()))?;
            entry.log.push(txn);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn position(&self) -> LogPosition {
        LogPosition(self.state.lock().position)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    pub fn acknowledged(&self, table: &str) -> Option<LogPosition> {
        self.state.lock().tables.get(table).and_then(|t| t.acknowledged)
    }

    pub fn fail_next_snapshot_after(&self, batches: usize) {
        self.state.lock().faults.snapshot_fail_after = Some(batches);
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.state.lock().faults.subscribe_failures = count;
    }

    pub fn set_batch_delay(&self, delay: Option<Duration>) {
        self.state.lock().faults.batch_delay = delay;
    }

    /// Ends every open change stream with a `Disconnected` error.
    pub fn disconnect_subscribers(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn snapshot(&self, table: &str, batch_size: usize) -> Result<SnapshotRead, SourceError> {
        let (rows, position, fail_after, delay) = {
            let mut state = self.state.lock();
            let position = LogPosition(state.position);
            let fail_after = state.faults.snapshot_fail_after.take();
            let delay = state.faults.batch_delay;
            let entry = state
                .tables
                .get(table)
                .ok_or_else(|| SourceError::UnknownTable(table.to_string()))?;
            let rows: Vec<RowImage> = entry.rows.values().cloned().collect();
            (rows, position, fail_after, delay)
        };
        let total_rows = Some(rows.len() as u64);
        let (tx, rx) = mpsc::channel(2);
        let batch_size = batch_size.max(1);
        let table = table.to_string();
        tokio::spawn(async move {
            for (sent, chunk) in rows.chunks(batch_size).enumerate() {
                if fail_after == Some(sent) {
                    let _ = tx
                        .send(Err(SourceError::Snapshot(format!(
                            "injected failure after {sent} batches"
                        ))))
                        .await;
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    debug!(table = %table, "snapshot reader went away");
                    return;
                }
            }
        });
        Ok(SnapshotRead {
            position,
            total_rows,
            batches: rx,
        })
    }

    async fn subscribe(&self, table: &str, after: LogPosition) -> Result<TransactionStream, SourceError> {
        let mut next_index = {
            let mut state = self.state.lock();
            if state.faults.subscribe_failures > 0 {
                state.faults.subscribe_failures -= 1;
                return Err(SourceError::Disconnected("injected subscribe failure".into()));
            }
            let entry = state
                .tables
                .get(table)
                .ok_or_else(|| SourceError::UnknownTable(table.to_string()))?;
            entry
                .log
                .iter()
                .rposition(|t| t.position <= after)
                .map_or(0, |i| i + 1)
        };

        let (tx, rx) = mpsc::channel(self.channel_capacity.max(1));
        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);
        let generation = Arc::clone(&self.generation);
        let subscribed_at = generation.load(Ordering::SeqCst);
        let table = table.to_string();
        tokio::spawn(async move {
            loop {
                let notified = notify.notified();
                if generation.load(Ordering::SeqCst) != subscribed_at {
                    let _ = tx
                        .send(Err(SourceError::Disconnected("subscriber disconnected".into())))
                        .await;
                    return;
                }
                let pending: Vec<Transaction> = {
                    let state = state.lock();
                    state
                        .tables
                        .get(&table)
                        .map(|t| t.log.get(next_index..).unwrap_or_default().to_vec())
                        .unwrap_or_default()
                };
                if pending.is_empty() {
                    tokio::select! {
                        _ = notified => {}
                        _ = tx.closed() => return,
                    }
                    continue;
                }
                for txn in pending {
                    if tx.send(Ok(txn)).await.is_err() {
                        return;
                    }
                    next_index += 1;
                }
            }
        });
        Ok(rx)
    }

    async fn acknowledge(&self, table: &str, position: LogPosition) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| SourceError::UnknownTable(table.to_string()))?;
        entry.acknowledged = Some(entry.acknowledged.map_or(position, |p| p.max(position)));
        Ok(())
    }
}
