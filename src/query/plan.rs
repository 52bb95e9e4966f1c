use crate::catalog::types::{PrimaryKey, Value};
use crate::query::error::QueryError;
use crate::storage::sort::Direction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Categorical membership.
    In(Vec<Value>),
    /// Inclusive range; an absent side is unbounded.
    Range {
        #[serde(default)]
        min: Option<Value>,
        #[serde(default)]
        max: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSpec {
    pub term: String,
    /// Columns to search; empty means every searchable column.
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortColumn {
    pub column: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortSpec {
    Column(SortColumn),
    /// Best match first; ties broken by `then`, else by primary key.
    Relevance {
        #[serde(default)]
        then: Option<SortColumn>,
    },
}

/// A client's filter/search/sort/page request against one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default)]
    pub filters: BTreeMap<String, Filter>,
    #[serde(default)]
    pub search: Option<SearchSpec>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    /// Opaque continuation token from a previous page.
    #[serde(default)]
    pub cursor: Option<String>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter_in(mut self, column: &str, values: Vec<Value>) -> Self {
        self.filters.insert(column.to_string(), Filter::In(values));
        self
    }

    pub fn filter_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter_in(column, vec![value.into()])
    }

    pub fn filter_range(mut self, column: &str, min: Option<Value>, max: Option<Value>) -> Self {
        self.filters
            .insert(column.to_string(), Filter::Range { min, max });
        self
    }

    pub fn search(mut self, term: &str, columns: &[&str]) -> Self {
        self.search = Some(SearchSpec {
            term: term.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.sort = Some(SortSpec::Column(SortColumn {
            column: column.to_string(),
            direction,
        }));
        self
    }

    pub fn by_relevance(mut self, then: Option<(&str, Direction)>) -> Self {
        self.sort = Some(SortSpec::Relevance {
            then: then.map(|(column, direction)| SortColumn {
                column: column.to_string(),
                direction,
            }),
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn cursor(mut self, token: impl Into<String>) -> Self {
        self.cursor = Some(token.into());
        self
    }
}

/// Where a page starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorPosition {
    Offset(usize),
    /// Strictly after the row with this sort value and key.
    After {
        value: Option<Value>,
        key: PrimaryKey,
    },
}

/// Decoded form of a continuation token. The fingerprint ties the token to
/// the table configuration it was minted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorToken {
    pub fingerprint: u64,
    pub position: CursorPosition,
}

pub fn encode_cursor(cursor: &CursorToken) -> Result<String, QueryError> {
    let bytes =
        rmp_serde::to_vec_named(cursor).map_err(|e| QueryError::InternalError(e.to_string()))?;
    Ok(hex::encode(bytes))
}

pub fn decode_cursor(encoded: &str) -> Result<CursorToken, QueryError> {
    let bytes = hex::decode(encoded).map_err(|e| QueryError::InvalidCursor {
        reason: e.to_string(),
    })?;
    rmp_serde::from_slice(&bytes).map_err(|e| QueryError::InvalidCursor {
        reason: e.to_string(),
    })
}
