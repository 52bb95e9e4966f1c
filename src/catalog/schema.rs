use crate::catalog::types::ColumnType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortKind {
    Alphabetical,
    Numeric,
    Date,
    Boolean,
}

impl SortKind {
    pub fn accepts(self, col_type: ColumnType) -> bool {
        match self {
            SortKind::Alphabetical => col_type == ColumnType::Text || col_type.is_numeric(),
            SortKind::Numeric => col_type.is_numeric(),
            SortKind::Date => col_type == ColumnType::Timestamp,
            SortKind::Boolean => col_type == ColumnType::Boolean,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Categorical,
    NumericRange,
    DateRange,
}

impl FilterKind {
    pub fn accepts(self, col_type: ColumnType) -> bool {
        match self {
            FilterKind::Categorical => true,
            FilterKind::NumericRange => col_type.is_numeric(),
            FilterKind::DateRange => col_type == ColumnType::Timestamp,
        }
    }

    pub fn is_range(self) -> bool {
        matches!(self, FilterKind::NumericRange | FilterKind::DateRange)
    }
}

/// Per-column roles as supplied by the configuration collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub sort: Option<SortKind>,
    #[serde(default)]
    pub filter: Option<FilterKind>,
}

impl ColumnConfig {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            searchable: false,
            sort: None,
            filter: None,
        }
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub fn sortable(mut self, kind: SortKind) -> Self {
        self.sort = Some(kind);
        self
    }

    pub fn filterable(mut self, kind: FilterKind) -> Self {
        self.filter = Some(kind);
        self
    }
}

/// Row-level security template: a session sees a row only when
/// `row[column] == claims[claim]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub column: String,
    pub claim: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableConfig {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub security: Option<SecurityPolicy>,
}

impl TableConfig {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            columns: Vec::new(),
            security: None,
        }
    }

    pub fn column(mut self, column: ColumnConfig) -> Self {
        self.columns.push(column);
        self
    }

    pub fn security(mut self, column: impl Into<String>, claim: impl Into<String>) -> Self {
        self.security = Some(SecurityPolicy {
            column: column.into(),
            claim: claim.into(),
        });
        self
    }
}
