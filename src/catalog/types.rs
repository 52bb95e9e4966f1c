use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

/// A typed cell value.
///
/// Ordering is total: `Null < Boolean < numbers < Timestamp < Text`, with
/// integers and floats compared numerically against each other so that a
/// numeric column may carry either representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(CompactString),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Microseconds since the Unix epoch, UTC.
    Timestamp(i64),
    Null,
}

impl Value {
    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::Timestamp(_) => 3,
            Value::Text(_) => 4,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn text(s: impl Into<CompactString>) -> Self {
        Value::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Timestamp(_) => "timestamp",
            Value::Null => "null",
        }
    }

    /// Whether this value may be stored in a column of `col_type`.
    pub fn fits(&self, col_type: ColumnType) -> bool {
        match (self, col_type) {
            (Value::Null, _) => true,
            (Value::Text(_), ColumnType::Text) => true,
            (Value::Integer(_), ColumnType::Integer | ColumnType::Float) => true,
            (Value::Float(_), ColumnType::Float) => true,
            (Value::Boolean(_), ColumnType::Boolean) => true,
            (Value::Timestamp(_), ColumnType::Timestamp) => true,
            _ => false,
        }
    }

    /// Parses `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` or RFC 3339 into a timestamp value.
    pub fn parse_timestamp(raw: &str) -> Option<Value> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(Value::Timestamp(dt.with_timezone(&Utc).timestamp_micros()));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
            return Some(Value::Timestamp(naive.and_utc().timestamp_micros()));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
            return Some(Value::Timestamp(naive.and_utc().timestamp_micros()));
        }
        let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
        let midnight = date.and_hms_opt(0, 0, 0)?;
        Some(Value::Timestamp(midnight.and_utc().timestamp_micros()))
    }

    /// Text used for tokenizing a searchable cell.
    pub fn search_text(&self) -> Option<String> {
        match self {
            Value::Text(s) => Some(s.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Timestamp(ts) => DateTime::<Utc>::from_timestamp_micros(*ts)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            Value::Null => None,
        }
    }
}

fn cmp_numeric(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::Integer(x), Value::Float(y)) => (*x as f64).total_cmp(y).then(Ordering::Less),
        (Value::Float(x), Value::Integer(y)) => x.total_cmp(&(*y as f64)).then(Ordering::Greater),
        _ => Ordering::Equal,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) => cmp_numeric(a, b),
        }
    }
}

// Integer(1) and Float(1.0) are distinct under `Ord` (the integer sorts first),
// so hashing the variant alongside the payload stays consistent with `Eq`.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Text(s) => s.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Boolean(b) => b.hash(state),
            Value::Timestamp(ts) => ts.hash(state),
            Value::Null => {}
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// Stable, unique identity of a row within one table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(pub Value);

impl PrimaryKey {
    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        PrimaryKey(Value::Integer(value))
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        PrimaryKey(Value::from(value))
    }
}

impl std::fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Value::Text(s) => write!(f, "{s}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Timestamp(ts) => write!(f, "@{ts}"),
            Value::Null => write!(f, "null"),
        }
    }
}

/// Immutable row snapshot, positional against the owning table's descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(idx).unwrap_or(&NULL)
    }
}

/// A row as delivered by a change source: column name to value.
pub type RowImage = BTreeMap<String, Value>;

/// Authenticated attributes of a client connection, e.g. `tenant_id`.
pub type Claims = BTreeMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::{PrimaryKey, Row, Value};
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Integer),
            any::<i64>().prop_map(Value::Timestamp),
            any::<f64>()
                .prop_filter("finite float only", |v| v.is_finite())
                .prop_map(Value::Float),
            "\\PC{0,32}".prop_map(|s| Value::Text(s.into())),
            Just(Value::Null),
        ]
    }

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    proptest! {
        #[test]
        fn roundtrip_row_msgpack(values in prop::collection::vec(arb_value(), 0..16)) {
            let row = Row::from_values(values);
            let bytes = rmp_serde::to_vec_named(&row).expect("encode");
            let decoded: Row = rmp_serde::from_slice(&bytes).expect("decode");
            prop_assert_eq!(row, decoded);
        }

        #[test]
        fn ordering_is_antisymmetric(a in arb_value(), b in arb_value()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn equal_values_hash_equally(a in arb_value(), b in arb_value()) {
            if a == b {
                prop_assert_eq!(hash_of(&a), hash_of(&b));
            }
        }
    }

    #[test]
    fn mixed_numeric_values_compare_numerically() {
        assert!(Value::Integer(2) < Value::Float(2.5));
        assert!(Value::Float(1.5) < Value::Integer(2));
        assert_ne!(Value::Integer(1), Value::Float(1.0));
        assert!(Value::Null < Value::Boolean(false));
        assert!(Value::Integer(i64::MAX) < Value::Timestamp(i64::MIN));
    }

    #[test]
    fn parses_dates_and_datetimes() {
        let day = Value::parse_timestamp("2024-01-02").expect("date");
        let later = Value::parse_timestamp("2024-01-02T10:00:00Z").expect("rfc3339");
        assert!(day < later);
        assert_eq!(
            Value::parse_timestamp("2024-01-02 00:00:00"),
            Some(day.clone())
        );
        assert!(Value::parse_timestamp("yesterday").is_none());
        assert_eq!(
            day.search_text().as_deref(),
            Some("2024-01-02 00:00:00")
        );
    }

    #[test]
    fn primary_key_serializes_as_bare_value() {
        let json = serde_json::to_string(&PrimaryKey::from(7i64)).expect("json");
        assert_eq!(json, r#"{"type":"integer","value":7}"#);
    }
}
