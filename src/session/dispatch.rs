use crate::protocol::ServerMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The client is not draining its channel fast enough.
    #[error("outbound channel full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Sending half of one connection's outbound channel, shared by all of its
/// sessions. Never blocks the ingestion path.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: u64,
    tx: mpsc::Sender<ServerMessage>,
}

impl Outbox {
    pub fn new(connection_id: u64, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { connection_id, tx }, rx)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn deliver(&self, message: ServerMessage) -> Result<(), DispatchError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::Full,
            TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
