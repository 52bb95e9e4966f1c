use crate::ingest::event::LogPosition;
use crate::status::{TableState, TableStatus};
use crate::storage::table::TableSnapshot;
use std::sync::Arc;

/// Everything a read needs, captured once: the table snapshot and the
/// ingestion status at the time of capture.
#[derive(Debug, Clone)]
pub struct TableReadView {
    pub table: Arc<TableSnapshot>,
    pub status: TableStatus,
}

impl TableReadView {
    pub fn position(&self) -> LogPosition {
        self.table.position
    }

    pub fn state(&self) -> TableState {
        self.status.state
    }

    /// Totals are withheld while the rows come from an unfinished snapshot
    /// load, whether it is still running or stalled.
    pub fn totals_known(&self) -> bool {
        self.status.snapshot_complete
    }

    pub fn is_stale(&self) -> bool {
        self.status.state == TableState::Stalled
    }
}
