use crate::ingest::event::LogPosition;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Indexing,
    Ready,
    Stalled,
}

impl TableState {
    pub fn as_str(self) -> &'static str {
        match self {
            TableState::Indexing => "indexing",
            TableState::Ready => "ready",
            TableState::Stalled => "stalled",
        }
    }
}

/// Operator-facing view of one table's ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStatus {
    pub table: String,
    pub state: TableState,
    pub processed_rows: u64,
    pub total_rows: Option<u64>,
    pub remaining_rows: Option<u64>,
    /// Fraction of the snapshot loaded, in `[0, 1]`, when the total is known.
    pub progress: Option<f64>,
    pub position: LogPosition,
    pub last_error: Option<String>,
    pub retry_attempt: u32,
    /// False from the start of a snapshot load until it completes, even if
    /// the load stalls part way.
    pub snapshot_complete: bool,
}

#[derive(Debug)]
struct StatusInner {
    state: TableState,
    processed_rows: u64,
    total_rows: Option<u64>,
    position: LogPosition,
    last_error: Option<String>,
    retry_attempt: u32,
    snapshot_complete: bool,
}

/// Shared status cell. The ingestion path writes it; everything else reads
/// a copy through [`StatusHandle::snapshot`].
#[derive(Debug, Clone)]
pub struct StatusHandle {
    table: Arc<str>,
    inner: Arc<RwLock<StatusInner>>,
}

impl StatusHandle {
    /// Tables start `ready` and empty; ingestion moves them to `indexing`.
    pub fn new(table: &str) -> Self {
        Self {
            table: Arc::from(table),
            inner: Arc::new(RwLock::new(StatusInner {
                state: TableState::Ready,
                processed_rows: 0,
                total_rows: None,
                position: LogPosition::ZERO,
                last_error: None,
                retry_attempt: 0,
                snapshot_complete: true,
            })),
        }
    }

    pub fn state(&self) -> TableState {
        self.inner.read().state
    }

    /// Exact totals need a fully loaded table.
    pub fn totals_known(&self) -> bool {
        self.inner.read().snapshot_complete
    }

    pub fn snapshot(&self) -> TableStatus {
        let inner = self.inner.read();
        let remaining_rows = inner
            .total_rows
            .map(|total| total.saturating_sub(inner.processed_rows));
        let progress = inner.total_rows.map(|total| {
            if total == 0 {
                1.0
            } else {
                (inner.processed_rows as f64 / total as f64).min(1.0)
            }
        });
        TableStatus {
            table: self.table.to_string(),
            state: inner.state,
            processed_rows: inner.processed_rows,
            total_rows: inner.total_rows,
            remaining_rows,
            progress,
            position: inner.position,
            last_error: inner.last_error.clone(),
            retry_attempt: inner.retry_attempt,
            snapshot_complete: inner.snapshot_complete,
        }
    }

    pub fn begin_indexing(&self, total_rows: Option<u64>) {
        let mut inner = self.inner.write();
        inner.state = TableState::Indexing;
        inner.snapshot_complete = false;
        inner.processed_rows = 0;
        inner.total_rows = total_rows;
        info!(table = %self.table, total_rows = ?total_rows, "table indexing started");
    }

    pub fn record_progress(&self, rows: u64) {
        let mut inner = self.inner.write();
        inner.processed_rows = inner.processed_rows.saturating_add(rows);
    }

    pub fn record_position(&self, position: LogPosition) {
        let mut inner = self.inner.write();
        inner.position = position;
    }

    pub fn mark_ready(&self, position: LogPosition) {
        let mut inner = self.inner.write();
        let previous = inner.state;
        inner.state = TableState::Ready;
        inner.snapshot_complete = true;
        inner.position = position;
        inner.last_error = None;
        inner.retry_attempt = 0;
        if previous != TableState::Ready {
            info!(
                table = %self.table,
                from = previous.as_str(),
                position = position.get(),
                processed_rows = inner.processed_rows,
                "table ready"
            );
        }
    }

    /// Keeps serving the last good state; only the flag and error change.
    pub fn mark_stalled(&self, error: impl Into<String>, attempt: u32) {
        let error = error.into();
        let mut inner = self.inner.write();
        inner.state = TableState::Stalled;
        inner.retry_attempt = attempt;
        warn!(table = %self.table, attempt, error = %error, "table stalled");
        inner.last_error = Some(error);
    }
}
