pub mod bootstrap;
pub mod event;
pub mod memory;
pub mod reader;
pub mod retry;
pub mod source;

use crate::catalog::types::{Row, RowImage};
use crate::error::LiveIndexError;
use crate::ingest::event::{LogPosition, Transaction};
use crate::status::StatusHandle;
use crate::storage::table::{AppliedTransaction, TableStore};
use parking_lot::Mutex;
use std::sync::Arc;

/// Observer of every snapshot a table publishes, called synchronously on the
/// ingestion path after the new head is visible. Calls for one table arrive
/// one at a time, in version order.
pub trait ChangeListener: Send + Sync {
    fn on_applied(&self, applied: &AppliedTransaction, status: &StatusHandle);
}

/// The write side of one table: its store, its status cell and whoever
/// reacts to its changes.
#[derive(Clone)]
pub struct IngestTarget {
    pub store: Arc<TableStore>,
    pub status: StatusHandle,
    listener: Option<Arc<dyn ChangeListener>>,
    // Held across publish and notification so listeners see versions in order.
    sequencer: Arc<Mutex<()>>,
}

impl std::fmt::Debug for IngestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestTarget")
            .field("table", &self.table())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl IngestTarget {
    pub fn new(store: Arc<TableStore>, status: StatusHandle) -> Self {
        Self {
            store,
            status,
            listener: None,
            sequencer: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn table(&self) -> &str {
        &self.store.descriptor().name
    }

    fn publish(&self, applied: AppliedTransaction) -> LogPosition {
        let position = applied.position();
        self.status.record_position(position);
        if let Some(listener) = &self.listener {
            listener.on_applied(&applied, &self.status);
        }
        position
    }

    /// Applies one transaction; `None` when it was a redelivery.
    pub fn apply(&self, txn: &Transaction) -> Result<Option<LogPosition>, LiveIndexError> {
        let _order = self.sequencer.lock();
        let Some(applied) = self.store.apply(txn)? else {
            return Ok(None);
        };
        Ok(Some(self.publish(applied)))
    }

    /// Loads one snapshot batch. A malformed image rejects the whole batch.
    pub fn load_images(&self, images: &[RowImage]) -> Result<usize, LiveIndexError> {
        let descriptor = self.store.descriptor();
        let rows = images
            .iter()
            .map(|image| descriptor.row_from_image(image))
            .collect::<Result<Vec<_>, _>>()?;
        let count = rows.len();
        let _order = self.sequencer.lock();
        self.publish(self.store.load_rows(rows));
        self.status.record_progress(count as u64);
        Ok(count)
    }

    pub fn advance_to(&self, position: LogPosition) {
        let _order = self.sequencer.lock();
        self.publish(self.store.advance_to(position));
    }

    pub fn restore(&self, rows: Vec<Row>, position: LogPosition) {
        let _order = self.sequencer.lock();
        self.publish(self.store.replace_all(rows, position));
    }

    pub fn reset(&self) {
        let _order = self.sequencer.lock();
        self.publish(self.store.reset());
    }
}
