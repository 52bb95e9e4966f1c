use crate::catalog::types::{PrimaryKey, RowImage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Totally ordered marker in a table's change feed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub const ZERO: LogPosition = LogPosition(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        LogPosition(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogPosition {
    fn from(value: u64) -> Self {
        LogPosition(value)
    }
}

/// A single row mutation as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert {
        row: RowImage,
    },
    /// `old_key` is set when the update changed the row's primary key.
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_key: Option<PrimaryKey>,
        row: RowImage,
    },
    Delete {
        key: PrimaryKey,
    },
}

impl ChangeEvent {
    pub fn insert(row: RowImage) -> Self {
        ChangeEvent::Insert { row }
    }

    pub fn update(row: RowImage) -> Self {
        ChangeEvent::Update { old_key: None, row }
    }

    pub fn delete(key: impl Into<PrimaryKey>) -> Self {
        ChangeEvent::Delete { key: key.into() }
    }
}

/// Events committed atomically at one log position. Either every event is
/// visible to readers or none is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub table: String,
    pub position: LogPosition,
    /// Source commit time, microseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at_micros: Option<i64>,
    pub events: Vec<ChangeEvent>,
}

impl Transaction {
    pub fn new(table: impl Into<String>, position: impl Into<LogPosition>, events: Vec<ChangeEvent>) -> Self {
        Self {
            table: table.into(),
            position: position.into(),
            committed_at_micros: None,
            events,
        }
    }
}

/// Builds a row image from `(column, value)` pairs.
#[macro_export]
macro_rules! row_image {
    ($($col:expr => $val:expr),* $(,)?) => {{
        let mut image = $crate::catalog::types::RowImage::new();
        $(image.insert(String::from($col), $crate::catalog::types::Value::from($val));)*
        image
    }};
}

#[cfg(test)]
mod tests {
    use super::{ChangeEvent, LogPosition, Transaction};
    use crate::catalog::types::{PrimaryKey, Value};

    #[test]
    fn events_serialize_with_op_tag() {
        let txn = Transaction::new(
            "logs",
            7,
            vec![
                ChangeEvent::insert(crate::row_image! { "id" => "1", "version" => "1.0" }),
                ChangeEvent::delete(PrimaryKey::from("2")),
            ],
        );
        let json = serde_json::to_value(&txn).expect("json");
        assert_eq!(json["position"], 7);
        assert_eq!(json["events"][0]["op"], "insert");
        assert_eq!(json["events"][1]["op"], "delete");
        let back: Transaction = serde_json::from_value(json).expect("decode");
        assert_eq!(back, txn);
    }

    #[test]
    fn row_image_macro_converts_values() {
        let image = crate::row_image! { "id" => 3i64, "ok" => true };
        assert_eq!(image.get("id"), Some(&Value::Integer(3)));
        assert_eq!(image.get("ok"), Some(&Value::Boolean(true)));
        assert!(LogPosition(3) < LogPosition(3).next());
    }
}
