use crate::query::error::QueryError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Configuration,
    UnknownTable,
    Source,
    ConsistencyViolation,
    Session,
    SessionNotFound,
    PermissionDenied,
    Query,
    Checkpoint,
    Encode,
    Decode,
    Io,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Configuration => "configuration_error",
            ErrorCode::UnknownTable => "unknown_table",
            ErrorCode::Source => "source_error",
            ErrorCode::ConsistencyViolation => "consistency_violation",
            ErrorCode::Session => "session_error",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Query => "query_error",
            ErrorCode::Checkpoint => "checkpoint_error",
            ErrorCode::Encode => "encode_error",
            ErrorCode::Decode => "decode_error",
            ErrorCode::Io => "io_error",
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorCode::Source | ErrorCode::Io)
    }
}

#[derive(Debug, Error)]
pub enum LiveIndexError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("table '{0}' is not configured")]
    UnknownTable(String),
    #[error("source error on table '{table}': {message}")]
    Source { table: String, message: String },
    #[error("consistency violation on table '{table}': {message}")]
    ConsistencyViolation { table: String, message: String },
    #[error("session {session_id}: {message}")]
    Session { session_id: u64, message: String },
    #[error("session {0} not found")]
    SessionNotFound(u64),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LiveIndexError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LiveIndexError::Configuration(_) => ErrorCode::Configuration,
            LiveIndexError::UnknownTable(_) => ErrorCode::UnknownTable,
            LiveIndexError::Source { .. } => ErrorCode::Source,
            LiveIndexError::ConsistencyViolation { .. } => ErrorCode::ConsistencyViolation,
            LiveIndexError::Session { .. } => ErrorCode::Session,
            LiveIndexError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            LiveIndexError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            LiveIndexError::Query(_) => ErrorCode::Query,
            LiveIndexError::Checkpoint(_) => ErrorCode::Checkpoint,
            LiveIndexError::Encode(_) => ErrorCode::Encode,
            LiveIndexError::Decode(_) => ErrorCode::Decode,
            LiveIndexError::Io(_) => ErrorCode::Io,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        LiveIndexError::Configuration(msg.into())
    }

    pub(crate) fn session(session_id: u64, msg: impl Into<String>) -> Self {
        LiveIndexError::Session {
            session_id,
            message: msg.into(),
        }
    }
}
