pub mod loader;
pub mod writer;

use crate::catalog::TableDescriptor;
use crate::catalog::types::Row;
use crate::error::LiveIndexError;
use crate::ingest::event::LogPosition;
use crate::storage::table::TableSnapshot;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Durable image of one table at one log position. Derived indexes are not
/// stored; they are rebuilt from the rows on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    pub table: String,
    pub fingerprint: u64,
    pub position: LogPosition,
    pub rows: Vec<Row>,
}

impl TableCheckpoint {
    pub fn capture(snapshot: &TableSnapshot) -> Self {
        Self {
            table: snapshot.descriptor.name.clone(),
            fingerprint: snapshot.descriptor.fingerprint,
            position: snapshot.position,
            rows: snapshot.rows.values().cloned().collect(),
        }
    }

    /// Whether this checkpoint was taken under `descriptor`'s configuration.
    pub fn matches(&self, descriptor: &TableDescriptor) -> bool {
        self.table == descriptor.name
            && self.fingerprint == descriptor.fingerprint
            && self
                .rows
                .iter()
                .all(|row| row.values.len() == descriptor.columns.len())
    }
}

/// Where the change stream reader persists its resume point. Calls are
/// blocking; the reader runs them off the async runtime.
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    fn save(&self, checkpoint: &TableCheckpoint) -> Result<(), LiveIndexError>;
    fn load(&self, table: &str) -> Result<Option<TableCheckpoint>, LiveIndexError>;
}

/// Checkpoints as files in one directory, keeping the newest few per table.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    keep: usize,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep: 2,
        }
    }

    pub fn keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &TableCheckpoint) -> Result<(), LiveIndexError> {
        writer::write_checkpoint(checkpoint, &self.dir)?;
        writer::prune_checkpoints(&self.dir, &checkpoint.table, self.keep)?;
        Ok(())
    }

    /// Falls back to older files when the newest is unreadable.
    fn load(&self, table: &str) -> Result<Option<TableCheckpoint>, LiveIndexError> {
        for (_, path) in loader::list_checkpoints(&self.dir, table)?.into_iter().rev() {
            match loader::load_checkpoint(&path) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(table, path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        Ok(None)
    }
}
