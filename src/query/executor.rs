use crate::catalog::types::{PrimaryKey, Row, Value};
use crate::ingest::event::LogPosition;
use crate::query::error::QueryError;
use crate::query::operators::{CompiledFilterKind, CompiledQuery, OrderBy, OrderKey};
use crate::query::plan::{CursorPosition, CursorToken, QuerySpec, decode_cursor, encode_cursor};
use crate::snapshot::reader::TableReadView;
use crate::status::TableState;
use crate::storage::table::TableSnapshot;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Candidate sets smaller than `1 / SPARSE_RATIO` of the table are sorted
/// directly instead of walking a sort index.
const SPARSE_RATIO: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

#[derive(Debug, Clone)]
pub struct QueryPage {
    pub rows: Vec<Row>,
    pub keys: Vec<PrimaryKey>,
    /// Exact number of matching rows; `None` while the table is indexing.
    pub total: Option<u64>,
    pub next_cursor: Option<String>,
    pub position: LogPosition,
    pub version: u64,
    pub state: TableState,
    pub stale: bool,
}

/// Window and exact total at one table version, as tracked by sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPage {
    pub keys: Vec<PrimaryKey>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Strictly after the edge; no edge starts at the first row.
    Forward,
    /// Strictly before the edge, moving away from it; no edge starts at the
    /// last row.
    Backward,
}

/// Resolves the query's offset or cursor into a starting point.
pub fn resolve_start(
    spec: &QuerySpec,
    compiled: &CompiledQuery,
    fingerprint: u64,
) -> Result<CursorPosition, QueryError> {
    match (&spec.cursor, spec.offset) {
        (Some(_), Some(_)) => Err(QueryError::InvalidQuery {
            reason: "offset and cursor are mutually exclusive".into(),
        }),
        (None, offset) => Ok(CursorPosition::Offset(offset.unwrap_or(0))),
        (Some(encoded), None) => {
            let token = decode_cursor(encoded)?;
            if token.fingerprint != fingerprint {
                return Err(QueryError::StaleCursor);
            }
            if let CursorPosition::After { value, .. } = &token.position {
                match compiled.order {
                    OrderBy::Relevance { .. } => {
                        return Err(QueryError::InvalidCursor {
                            reason: "keyset cursor cannot resume a relevance ordered query".into(),
                        });
                    }
                    OrderBy::Column { .. } if value.is_none() => {
                        return Err(QueryError::InvalidCursor {
                            reason: "cursor does not match the query's sort order".into(),
                        });
                    }
                    OrderBy::PrimaryKey if value.is_some() => {
                        return Err(QueryError::InvalidCursor {
                            reason: "cursor does not match the query's sort order".into(),
                        });
                    }
                    _ => {}
                }
            }
            Ok(token.position)
        }
    }
}

fn as_after(position: &CursorPosition) -> Option<OrderKey> {
    match position {
        CursorPosition::After { value, key } => Some(OrderKey {
            relevance: None,
            value: value.clone(),
            key: key.clone(),
        }),
        CursorPosition::Offset(_) => None,
    }
}

/// Answers one page of `spec` from a captured read view.
pub fn execute(
    view: &TableReadView,
    compiled: &CompiledQuery,
    spec: &QuerySpec,
    limits: PageLimits,
) -> Result<QueryPage, QueryError> {
    let limit = spec.limit.unwrap_or(limits.default_page_size);
    if limit > limits.max_page_size {
        return Err(QueryError::LimitExceeded {
            requested: limit,
            max: limits.max_page_size,
        });
    }
    let table = &view.table;
    let start = resolve_start(spec, compiled, table.descriptor.fingerprint)?;
    let candidates = candidate_keys(table, compiled)?;

    let offset = match start {
        CursorPosition::Offset(n) => n,
        CursorPosition::After { .. } => 0,
    };
    let mut after = as_after(&start);
    let mut skip = offset;
    if skip > 0 && after.is_none() && compiled.is_unfiltered() {
        if let Some(jump) = unfiltered_key_at(table, compiled, skip - 1) {
            after = Some(jump);
            skip = 0;
        }
    }

    let mut keys: Vec<OrderKey> = Vec::with_capacity(limit.min(1024));
    let mut has_more = false;
    walk(table, compiled, candidates.as_ref(), after.as_ref(), |k| {
        if skip > 0 {
            skip -= 1;
            return true;
        }
        if keys.len() == limit {
            has_more = true;
            return false;
        }
        keys.push(k);
        true
    })?;

    let next_cursor = match keys.last() {
        Some(last) if has_more => {
            let position = if compiled.has_index_order() {
                CursorPosition::After {
                    value: last.value.clone(),
                    key: last.key.clone(),
                }
            } else {
                CursorPosition::Offset(offset + keys.len())
            };
            Some(encode_cursor(&CursorToken {
                fingerprint: table.descriptor.fingerprint,
                position,
            })?)
        }
        _ => None,
    };

    let total = if view.totals_known() {
        Some(count_matches(table, compiled, candidates.as_ref()))
    } else {
        None
    };

    let rows = keys
        .iter()
        .filter_map(|k| table.row(&k.key).cloned())
        .collect();
    Ok(QueryPage {
        rows,
        keys: keys.into_iter().map(|k| k.key).collect(),
        total,
        next_cursor,
        position: table.position,
        version: table.version,
        state: view.state(),
        stale: view.is_stale(),
    })
}

/// The `[offset, offset + limit)` window of matches plus the exact total.
pub fn window(
    table: &TableSnapshot,
    compiled: &CompiledQuery,
    offset: usize,
    limit: usize,
) -> Result<WindowPage, QueryError> {
    let candidates = candidate_keys(table, compiled)?;
    let mut skip = offset;
    let mut keys = Vec::with_capacity(limit);
    if limit > 0 {
        walk(table, compiled, candidates.as_ref(), None, |k| {
            if skip > 0 {
                skip -= 1;
                return true;
            }
            keys.push(k.key);
            keys.len() < limit
        })?;
    }
    Ok(WindowPage {
        keys,
        total: count_matches(table, compiled, candidates.as_ref()),
    })
}

/// Number of matches at or before `after` in query order, i.e. the offset
/// of the first row a keyset cursor would return.
pub fn offset_after(
    table: &TableSnapshot,
    compiled: &CompiledQuery,
    after: &CursorPosition,
) -> Result<usize, QueryError> {
    let Some(after) = as_after(after) else {
        return Ok(match after {
            CursorPosition::Offset(n) => *n,
            CursorPosition::After { .. } => 0,
        });
    };
    let candidates = candidate_keys(table, compiled)?;
    let mut count = 0usize;
    walk(table, compiled, candidates.as_ref(), None, |k| {
        if compiled.compare(&k, &after) == Ordering::Greater {
            return false;
        }
        count += 1;
        true
    })?;
    Ok(count)
}

/// Visits matching rows from `edge` outwards in `direction` until `visit`
/// returns false.
pub fn scan_from<F>(
    table: &TableSnapshot,
    compiled: &CompiledQuery,
    edge: Option<&OrderKey>,
    direction: ScanDirection,
    mut visit: F,
) -> Result<(), QueryError>
where
    F: FnMut(OrderKey) -> bool,
{
    if direction == ScanDirection::Forward {
        return walk(table, compiled, None, edge, visit);
    }

    match compiled.order {
        OrderBy::Column { column, direction } => {
            let index = sort_index(table, column)?;
            let end = match edge {
                Some(k) => index.lower_bound(direction, value_of(k), &k.key),
                None => index.len(),
            };
            for entry in index.head(direction, end).iter().rev() {
                let Some(row) = table.row(&entry.key) else {
                    continue;
                };
                let Some(relevance) = compiled.evaluate(row) else {
                    continue;
                };
                if !visit(compiled.order_key(&entry.key, row, relevance)) {
                    break;
                }
            }
        }
        OrderBy::PrimaryKey => {
            let upper = match edge {
                Some(k) => Bound::Excluded(k.key.clone()),
                None => Bound::Unbounded,
            };
            for (key, row) in table.rows.range((Bound::Unbounded, upper)).rev() {
                let Some(relevance) = compiled.evaluate(row) else {
                    continue;
                };
                if !visit(compiled.order_key(key, row, relevance)) {
                    break;
                }
            }
        }
        OrderBy::Relevance { .. } => {
            let keyed = sorted_matches(table, compiled, None);
            for k in keyed.into_iter().rev() {
                if edge.is_some_and(|e| compiled.compare(&k, e) != Ordering::Less) {
                    continue;
                }
                if !visit(k) {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Row ids that can possibly match, from the filter, security and search
/// indexes. `None` means no index narrows the query.
pub fn candidate_keys(
    table: &TableSnapshot,
    compiled: &CompiledQuery,
) -> Result<Option<BTreeSet<PrimaryKey>>, QueryError> {
    let mut acc: Option<BTreeSet<PrimaryKey>> = None;
    let narrow = |acc: &mut Option<BTreeSet<PrimaryKey>>, set: BTreeSet<PrimaryKey>| {
        *acc = Some(match acc.take() {
            None => set,
            Some(prev) => {
                let (small, large) = if prev.len() <= set.len() { (prev, set) } else { (set, prev) };
                small.into_iter().filter(|k| large.contains(k)).collect()
            }
        });
    };

    for filter in &compiled.filters {
        let index = table.filter_index(filter.column).ok_or_else(|| {
            QueryError::InternalError(format!("missing filter index for column {}", filter.column))
        })?;
        let set = match &filter.kind {
            CompiledFilterKind::In(values) => index.scan_in(values),
            CompiledFilterKind::Range { start, end } => index
                .scan_range(start.clone(), end.clone())
                .ok_or_else(|| {
                    QueryError::InternalError(format!(
                        "column {} has no ordered index",
                        filter.column
                    ))
                })?,
        };
        narrow(&mut acc, set);
        if acc.as_ref().is_some_and(BTreeSet::is_empty) {
            return Ok(acc);
        }
    }

    if let Some(scope) = &compiled.security
        && let Some(index) = table.categorical_index(scope.column)
    {
        let set = index
            .get(&scope.value)
            .map(|pks| pks.iter().cloned().collect())
            .unwrap_or_default();
        narrow(&mut acc, set);
    }

    if let Some(search) = &compiled.search {
        for token in search.query.tokens() {
            let mut hits = BTreeSet::new();
            for column in &search.columns {
                if let Some(index) = table.search_index(*column) {
                    hits.extend(index.candidates(&search.query, token));
                }
            }
            narrow(&mut acc, hits);
            if acc.as_ref().is_some_and(BTreeSet::is_empty) {
                return Ok(acc);
            }
        }
    }
    Ok(acc)
}

/// Exact number of matching rows.
pub fn count_matches(
    table: &TableSnapshot,
    compiled: &CompiledQuery,
    candidates: Option<&BTreeSet<PrimaryKey>>,
) -> u64 {
    if compiled.is_unfiltered() {
        return table.len() as u64;
    }
    let security_indexed = compiled
        .security
        .as_ref()
        .is_none_or(|s| table.categorical_index(s.column).is_some());
    match candidates {
        Some(keys) if compiled.search.is_none() && security_indexed => keys.len() as u64,
        Some(keys) => keys
            .iter()
            .filter(|k| {
                table
                    .row(k)
                    .is_some_and(|row| compiled.evaluate(row).is_some())
            })
            .count() as u64,
        None => table
            .rows
            .values()
            .filter(|row| compiled.evaluate(row).is_some())
            .count() as u64,
    }
}

fn sort_index(
    table: &TableSnapshot,
    column: usize,
) -> Result<&crate::storage::sort::SortIndex, QueryError> {
    table
        .sort_index(column)
        .ok_or_else(|| QueryError::InternalError(format!("missing sort index for column {column}")))
}

fn value_of(key: &OrderKey) -> &Value {
    static NULL: Value = Value::Null;
    key.value.as_ref().unwrap_or(&NULL)
}

/// Key of the row at `position` when every row matches.
fn unfiltered_key_at(table: &TableSnapshot, compiled: &CompiledQuery, position: usize) -> Option<OrderKey> {
    let OrderBy::Column { column, direction } = compiled.order else {
        return None;
    };
    let entry = table.sort_index(column)?.get(direction, position)?;
    Some(OrderKey {
        relevance: None,
        value: Some(entry.value.clone()),
        key: entry.key.clone(),
    })
}

fn sorted_matches(
    table: &TableSnapshot,
    compiled: &CompiledQuery,
    candidates: Option<&BTreeSet<PrimaryKey>>,
) -> Vec<OrderKey> {
    let mut keyed: Vec<OrderKey> = match candidates {
        Some(keys) => keys
            .iter()
            .filter_map(|k| table.row(k).and_then(|row| compiled.key_of(k, row)))
            .collect(),
        None => table
            .rows
            .iter()
            .filter_map(|(k, row)| compiled.key_of(k, row))
            .collect(),
    };
    keyed.sort_by(|a, b| compiled.compare(a, b));
    keyed
}

/// Visits matching rows strictly after `after` in query order until
/// `visit` returns false.
fn walk<F>(
    table: &TableSnapshot,
    compiled: &CompiledQuery,
    candidates: Option<&BTreeSet<PrimaryKey>>,
    after: Option<&OrderKey>,
    mut visit: F,
) -> Result<(), QueryError>
where
    F: FnMut(OrderKey) -> bool,
{
    let sparse = candidates.is_some_and(|c| c.len().saturating_mul(SPARSE_RATIO) < table.len());
    match compiled.order {
        OrderBy::Column { column, direction } if !sparse => {
            let index = sort_index(table, column)?;
            let start = match after {
                Some(k) => index.upper_bound(direction, value_of(k), &k.key),
                None => 0,
            };
            for entry in index.tail(direction, start).iter() {
                if candidates.is_some_and(|c| !c.contains(&entry.key)) {
                    continue;
                }
                let Some(row) = table.row(&entry.key) else {
                    continue;
                };
                let Some(relevance) = compiled.evaluate(row) else {
                    continue;
                };
                if !visit(compiled.order_key(&entry.key, row, relevance)) {
                    break;
                }
            }
        }
        OrderBy::PrimaryKey => {
            let lower = match after {
                Some(k) => Bound::Excluded(k.key.clone()),
                None => Bound::Unbounded,
            };
            match candidates {
                Some(keys) => {
                    for key in keys.range((lower, Bound::Unbounded)) {
                        let Some(row) = table.row(key) else {
                            continue;
                        };
                        let Some(relevance) = compiled.evaluate(row) else {
                            continue;
                        };
                        if !visit(compiled.order_key(key, row, relevance)) {
                            break;
                        }
                    }
                }
                None => {
                    for (key, row) in table.rows.range((lower, Bound::Unbounded)) {
                        let Some(relevance) = compiled.evaluate(row) else {
                            continue;
                        };
                        if !visit(compiled.order_key(key, row, relevance)) {
                            break;
                        }
                    }
                }
            }
        }
        _ => {
            for k in sorted_matches(table, compiled, candidates) {
                if after.is_some_and(|a| compiled.compare(&k, a) != Ordering::Greater) {
                    continue;
                }
                if !visit(k) {
                    break;
                }
            }
        }
    }
    Ok(())
}
