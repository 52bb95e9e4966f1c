pub mod schema;
pub mod types;

use crate::catalog::schema::{FilterKind, SortKind, TableConfig};
use crate::catalog::types::{Claims, ColumnType, PrimaryKey, Row, RowImage, Value};
use crate::error::LiveIndexError;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub position: usize,
    pub column_type: ColumnType,
    pub searchable: bool,
    pub sort: Option<SortKind>,
    pub filter: Option<FilterKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDescriptor {
    pub column: usize,
    pub claim: String,
}

/// A security template bound to one connection's claims: only rows with
/// `row[column] == value` are visible.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecurityScope {
    pub column: usize,
    pub value: Value,
}

impl SecurityScope {
    pub fn allows(&self, row: &Row) -> bool {
        row.get(self.column) == &self.value
    }
}

/// A table's configuration resolved once into positional, typed form.
///
/// Built at table registration and never re-interpreted per request: every
/// index structure and every compiled query refers to columns by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: usize,
    pub security: Option<SecurityDescriptor>,
    /// Stable hash of the source configuration; cursors carry it so that a
    /// cursor minted under another configuration is rejected.
    pub fingerprint: u64,
    by_name: HashMap<String, usize>,
}

impl TableDescriptor {
    pub fn resolve(config: &TableConfig) -> Result<Self, LiveIndexError> {
        if config.name.trim().is_empty() {
            return Err(LiveIndexError::config("table name must not be empty"));
        }
        if config.columns.is_empty() {
            return Err(LiveIndexError::config(format!(
                "table '{}' has no columns",
                config.name
            )));
        }

        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(config.columns.len());
        for (position, col) in config.columns.iter().enumerate() {
            if !seen.insert(col.name.as_str()) {
                return Err(LiveIndexError::config(format!(
                    "duplicate column '{}' in table '{}'",
                    col.name, config.name
                )));
            }
            if let Some(kind) = col.sort
                && !kind.accepts(col.column_type)
            {
                return Err(LiveIndexError::config(format!(
                    "sort kind {kind:?} is not valid for {} column '{}'",
                    col.column_type.as_str(),
                    col.name
                )));
            }
            if let Some(kind) = col.filter
                && !kind.accepts(col.column_type)
            {
                return Err(LiveIndexError::config(format!(
                    "filter kind {kind:?} is not valid for {} column '{}'",
                    col.column_type.as_str(),
                    col.name
                )));
            }
            columns.push(ColumnDescriptor {
                name: col.name.clone(),
                position,
                column_type: col.column_type,
                searchable: col.searchable,
                sort: col.sort,
                filter: col.filter,
            });
        }

        let by_name: HashMap<String, usize> = columns
            .iter()
            .map(|c| (c.name.clone(), c.position))
            .collect();
        let primary_key = *by_name.get(&config.primary_key).ok_or_else(|| {
            LiveIndexError::config(format!(
                "primary key column '{}' not found in table '{}'",
                config.primary_key, config.name
            ))
        })?;

        let security = match &config.security {
            Some(policy) => {
                let column = *by_name.get(&policy.column).ok_or_else(|| {
                    LiveIndexError::config(format!(
                        "security column '{}' not found in table '{}'",
                        policy.column, config.name
                    ))
                })?;
                if policy.claim.is_empty() {
                    return Err(LiveIndexError::config("security claim must not be empty"));
                }
                Some(SecurityDescriptor {
                    column,
                    claim: policy.claim.clone(),
                })
            }
            None => None,
        };

        Ok(Self {
            name: config.name.clone(),
            columns,
            primary_key,
            security,
            fingerprint: fingerprint(config)?,
            by_name,
        })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.by_name.get(name).map(|idx| &self.columns[*idx])
    }

    /// Looks up a column referenced by a request; unknown names are a
    /// configuration violation, never silently ignored.
    pub fn require_column(&self, name: &str) -> Result<&ColumnDescriptor, LiveIndexError> {
        self.column(name).ok_or_else(|| {
            LiveIndexError::config(format!(
                "column '{name}' is not configured on table '{}'",
                self.name
            ))
        })
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn sortable_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.sort.is_some())
    }

    pub fn searchable_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.searchable)
    }

    pub fn filter_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.filter.is_some())
    }

    /// Categorical filter columns; these are the facet columns.
    pub fn categorical_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns
            .iter()
            .filter(|c| c.filter == Some(FilterKind::Categorical))
    }

    /// Binds the table's security template to `claims`. Tables without a
    /// policy yield `None`; a missing claim is a permission error.
    pub fn scope_for(&self, claims: &Claims) -> Result<Option<SecurityScope>, LiveIndexError> {
        let Some(policy) = &self.security else {
            return Ok(None);
        };
        let value = claims.get(&policy.claim).ok_or_else(|| {
            LiveIndexError::PermissionDenied(format!(
                "claim '{}' is required to read table '{}'",
                policy.claim, self.name
            ))
        })?;
        Ok(Some(SecurityScope {
            column: policy.column,
            value: value.clone(),
        }))
    }

    pub fn primary_key_of(&self, row: &Row) -> PrimaryKey {
        PrimaryKey(row.get(self.primary_key).clone())
    }

    /// Resolves a source row image into a positional row, type-checking each
    /// configured column. Unconfigured columns in the image are ignored;
    /// missing columns become `Null`.
    pub fn row_from_image(&self, image: &RowImage) -> Result<Row, LiveIndexError> {
        let mut values = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let value = image.get(&col.name).cloned().unwrap_or(Value::Null);
            let value = coerce(value, col.column_type);
            if !value.fits(col.column_type) {
                return Err(LiveIndexError::Decode(format!(
                    "column '{}' of table '{}' expects {}, got {}",
                    col.name,
                    self.name,
                    col.column_type.as_str(),
                    value.type_name()
                )));
            }
            values.push(value);
        }
        if values[self.primary_key].is_null() {
            return Err(LiveIndexError::Decode(format!(
                "row for table '{}' has a null primary key",
                self.name
            )));
        }
        Ok(Row::from_values(values))
    }

    pub fn row_to_image(&self, row: &Row) -> RowImage {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), row.get(c.position).clone()))
            .collect()
    }
}

// Sources commonly ship timestamps as text.
fn coerce(value: Value, col_type: ColumnType) -> Value {
    match (&value, col_type) {
        (Value::Text(s), ColumnType::Timestamp) => Value::parse_timestamp(s).unwrap_or(value),
        _ => value,
    }
}

fn fingerprint(config: &TableConfig) -> Result<u64, LiveIndexError> {
    let encoded = serde_json::to_vec(config).map_err(|e| LiveIndexError::Encode(e.to_string()))?;
    let digest = Sha256::digest(&encoded);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(prefix))
}
