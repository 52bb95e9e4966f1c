use std::fmt;

/// Recoverable request-level failures. The table and any session involved
/// are left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    InvalidCursor { reason: String },
    StaleCursor,
    InvalidQuery { reason: String },
    LimitExceeded { requested: usize, max: usize },
    InternalError(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::InvalidCursor { reason } => write!(f, "invalid cursor: {reason}"),
            QueryError::StaleCursor => {
                write!(f, "cursor was issued for a different table schema")
            }
            QueryError::InvalidQuery { reason } => write!(f, "invalid query: {reason}"),
            QueryError::LimitExceeded { requested, max } => {
                write!(f, "page size {requested} exceeds maximum of {max}")
            }
            QueryError::InternalError(msg) => write!(f, "internal query error: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}
