use crate::catalog::types::RowImage;
use crate::error::LiveIndexError;
use crate::ingest::event::{LogPosition, Transaction};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source disconnected: {0}")]
    Disconnected(String),
    #[error("snapshot failed: {0}")]
    Snapshot(String),
    #[error("table '{0}' is not published by the source")]
    UnknownTable(String),
    #[error("malformed change: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn into_error(self, table: &str) -> LiveIndexError {
        match self {
            SourceError::Decode(message) => LiveIndexError::Decode(format!("table '{table}': {message}")),
            other => LiveIndexError::Source {
                table: table.to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type SnapshotBatches = mpsc::Receiver<Result<Vec<RowImage>, SourceError>>;
pub type TransactionStream = mpsc::Receiver<Result<Transaction, SourceError>>;

/// A consistent point-in-time read of one table.
#[derive(Debug)]
pub struct SnapshotRead {
    /// Every committed transaction at or below this position is reflected in
    /// the batches; nothing above it is.
    pub position: LogPosition,
    pub total_rows: Option<u64>,
    pub batches: SnapshotBatches,
}

/// The database side of change data capture: snapshots plus an ordered,
/// transaction-grouped change stream per table.
#[async_trait]
pub trait ChangeSource: Send + Sync + std::fmt::Debug {
    async fn snapshot(&self, table: &str, batch_size: usize) -> Result<SnapshotRead, SourceError>;

    /// Committed transactions strictly after `after`, in commit order.
    async fn subscribe(&self, table: &str, after: LogPosition) -> Result<TransactionStream, SourceError>;

    /// Everything at or below `position` is durably indexed and need not be
    /// retained for this reader.
    async fn acknowledge(&self, _table: &str, _position: LogPosition) -> Result<(), SourceError> {
        Ok(())
    }
}
