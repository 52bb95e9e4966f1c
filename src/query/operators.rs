use crate::catalog::schema::FilterKind;
use crate::catalog::types::{ColumnType, PrimaryKey, Row, Value};
use crate::catalog::{SecurityScope, TableDescriptor};
use crate::error::LiveIndexError;
use crate::query::error::QueryError;
use crate::query::plan::{Filter, QuerySpec, SortColumn, SortSpec};
use crate::storage::search::{Relevance, SearchOptions, SearchQuery};
use crate::storage::sort::{Direction, compare_entries};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::ops::Bound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledFilterKind {
    /// Sorted, deduplicated.
    In(SmallVec<[Value; 4]>),
    Range { start: Bound<Value>, end: Bound<Value> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFilter {
    pub column: usize,
    pub kind: CompiledFilterKind,
}

impl CompiledFilter {
    fn matches(&self, row: &Row) -> bool {
        let value = row.get(self.column);
        match &self.kind {
            CompiledFilterKind::In(values) => values.binary_search(value).is_ok(),
            CompiledFilterKind::Range { start, end } => {
                if value.is_null() {
                    return false;
                }
                let above = match start {
                    Bound::Included(s) => value >= s,
                    Bound::Excluded(s) => value > s,
                    Bound::Unbounded => true,
                };
                let below = match end {
                    Bound::Included(e) => value <= e,
                    Bound::Excluded(e) => value < e,
                    Bound::Unbounded => true,
                };
                above && below
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSearch {
    pub columns: Vec<usize>,
    pub query: SearchQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    PrimaryKey,
    Column { column: usize, direction: Direction },
    Relevance { then: Option<(usize, Direction)> },
}

/// Position of a matching row in query order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub relevance: Option<Relevance>,
    pub value: Option<Value>,
    pub key: PrimaryKey,
}

/// A query resolved against one table descriptor: every column reference is
/// positional and typed, and the connection's security scope is folded in.
/// Evaluating a row is pure, so the executor and live sessions agree on
/// membership and order for any snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub filters: Vec<CompiledFilter>,
    pub search: Option<CompiledSearch>,
    pub security: Option<SecurityScope>,
    pub order: OrderBy,
}

impl CompiledQuery {
    pub fn compile(
        descriptor: &TableDescriptor,
        spec: &QuerySpec,
        security: Option<SecurityScope>,
        search_options: SearchOptions,
    ) -> Result<Self, LiveIndexError> {
        let mut filters = Vec::with_capacity(spec.filters.len());
        for (name, filter) in &spec.filters {
            let col = descriptor.require_column(name)?;
            let Some(kind) = col.filter else {
                return Err(LiveIndexError::config(format!(
                    "column '{name}' is not filterable on table '{}'",
                    descriptor.name
                )));
            };
            let compiled = match (filter, kind) {
                (Filter::In(values), FilterKind::Categorical) => {
                    let mut values: SmallVec<[Value; 4]> = values
                        .iter()
                        .map(|v| coerce_filter_value(name, v.clone(), col.column_type))
                        .collect::<Result<_, _>>()?;
                    values.sort();
                    values.dedup();
                    CompiledFilterKind::In(values)
                }
                (Filter::Range { min, max }, FilterKind::NumericRange | FilterKind::DateRange) => {
                    let start = match min {
                        Some(v) => Bound::Included(coerce_filter_value(name, v.clone(), col.column_type)?),
                        None => Bound::Unbounded,
                    };
                    let end = match max {
                        Some(v) => Bound::Included(coerce_filter_value(name, v.clone(), col.column_type)?),
                        None => Bound::Unbounded,
                    };
                    CompiledFilterKind::Range { start, end }
                }
                (Filter::In(_), _) => {
                    return Err(LiveIndexError::config(format!(
                        "column '{name}' is not configured for categorical filtering"
                    )));
                }
                (Filter::Range { .. }, _) => {
                    return Err(LiveIndexError::config(format!(
                        "column '{name}' is not configured for range filtering"
                    )));
                }
            };
            filters.push(CompiledFilter {
                column: col.position,
                kind: compiled,
            });
        }

        let search = match &spec.search {
            Some(s) => {
                let columns = if s.columns.is_empty() {
                    let all: Vec<usize> = descriptor.searchable_columns().map(|c| c.position).collect();
                    if all.is_empty() {
                        return Err(LiveIndexError::config(format!(
                            "table '{}' has no searchable columns",
                            descriptor.name
                        )));
                    }
                    all
                } else {
                    let mut cols = Vec::with_capacity(s.columns.len());
                    for name in &s.columns {
                        let col = descriptor.require_column(name)?;
                        if !col.searchable {
                            return Err(LiveIndexError::config(format!(
                                "column '{name}' is not searchable on table '{}'",
                                descriptor.name
                            )));
                        }
                        cols.push(col.position);
                    }
                    cols.sort_unstable();
                    cols.dedup();
                    cols
                };
                SearchQuery::parse(&s.term, search_options)
                    .map(|query| CompiledSearch { columns, query })
            }
            None => None,
        };

        let sort_column = |sc: &SortColumn| -> Result<(usize, Direction), LiveIndexError> {
            let col = descriptor.require_column(&sc.column)?;
            if col.sort.is_none() {
                return Err(LiveIndexError::config(format!(
                    "column '{}' is not sortable on table '{}'",
                    sc.column, descriptor.name
                )));
            }
            Ok((col.position, sc.direction))
        };
        let order = match &spec.sort {
            Some(SortSpec::Column(sc)) => {
                let (column, direction) = sort_column(sc)?;
                OrderBy::Column { column, direction }
            }
            Some(SortSpec::Relevance { then }) => {
                if spec.search.is_none() {
                    return Err(QueryError::InvalidQuery {
                        reason: "relevance order requires a search term".into(),
                    }
                    .into());
                }
                let then = then.as_ref().map(sort_column).transpose()?;
                if search.is_some() {
                    OrderBy::Relevance { then }
                } else {
                    // Blank term: nothing to rank by.
                    then.map(|(column, direction)| OrderBy::Column { column, direction })
                        .unwrap_or(OrderBy::PrimaryKey)
                }
            }
            None if search.is_some() => OrderBy::Relevance { then: None },
            None => OrderBy::PrimaryKey,
        };

        Ok(Self {
            filters,
            search,
            security,
            order,
        })
    }

    /// No predicate at all: every row matches.
    pub fn is_unfiltered(&self) -> bool {
        self.filters.is_empty() && self.search.is_none() && self.security.is_none()
    }

    /// Whether row membership and order can be maintained incrementally from
    /// the order's sort structure.
    pub fn has_index_order(&self) -> bool {
        !matches!(self.order, OrderBy::Relevance { .. })
    }

    /// `None` when the row does not match; otherwise its relevance, if the
    /// query searches.
    pub fn evaluate(&self, row: &Row) -> Option<Option<Relevance>> {
        if let Some(scope) = &self.security
            && !scope.allows(row)
        {
            return None;
        }
        if !self.filters.iter().all(|f| f.matches(row)) {
            return None;
        }
        match &self.search {
            Some(search) => search
                .query
                .score(search.columns.iter().map(|c| row.get(*c)))
                .map(Some),
            None => Some(None),
        }
    }

    pub fn order_key(&self, key: &PrimaryKey, row: &Row, relevance: Option<Relevance>) -> OrderKey {
        let value = match self.order {
            OrderBy::PrimaryKey => None,
            OrderBy::Column { column, .. } => Some(row.get(column).clone()),
            OrderBy::Relevance { then } => then.map(|(column, _)| row.get(column).clone()),
        };
        OrderKey {
            relevance,
            value,
            key: key.clone(),
        }
    }

    /// Evaluates and keys a row in one step.
    pub fn key_of(&self, key: &PrimaryKey, row: &Row) -> Option<OrderKey> {
        self.evaluate(row)
            .map(|relevance| self.order_key(key, row, relevance))
    }

    pub fn compare(&self, a: &OrderKey, b: &OrderKey) -> Ordering {
        fn value(k: &OrderKey) -> &Value {
            static NULL: Value = Value::Null;
            k.value.as_ref().unwrap_or(&NULL)
        }
        match self.order {
            OrderBy::PrimaryKey => a.key.cmp(&b.key),
            OrderBy::Column { direction, .. } => {
                compare_entries(direction, value(a), &a.key, value(b), &b.key)
            }
            OrderBy::Relevance { then } => b.relevance.cmp(&a.relevance).then_with(|| match then {
                Some((_, direction)) => compare_entries(direction, value(a), &a.key, value(b), &b.key),
                None => a.key.cmp(&b.key),
            }),
        }
    }

    /// An equality constraint every matching row satisfies, used to route
    /// changes to sessions: the first categorical filter, else the security
    /// scope.
    pub fn anchor(&self) -> Option<(usize, SmallVec<[Value; 4]>)> {
        let categorical = self.filters.iter().find_map(|f| match &f.kind {
            CompiledFilterKind::In(values) => Some((f.column, values.clone())),
            CompiledFilterKind::Range { .. } => None,
        });
        categorical.or_else(|| {
            self.security
                .as_ref()
                .map(|s| (s.column, SmallVec::from_elem(s.value.clone(), 1)))
        })
    }
}

fn coerce_filter_value(column: &str, value: Value, col_type: ColumnType) -> Result<Value, LiveIndexError> {
    let value = match (&value, col_type) {
        (Value::Text(s), ColumnType::Timestamp) => Value::parse_timestamp(s).ok_or_else(|| {
            QueryError::InvalidQuery {
                reason: format!("'{s}' is not a date for column '{column}'"),
            }
        })?,
        _ => value,
    };
    if !value.fits(col_type) {
        return Err(QueryError::InvalidQuery {
            reason: format!(
                "column '{column}' expects {}, got {}",
                col_type.as_str(),
                value.type_name()
            ),
        }
        .into());
    }
    Ok(value)
}
