use crate::catalog::types::PrimaryKey;
use crate::protocol::MovedRow;
use crate::query::error::QueryError;
use crate::query::executor::{ScanDirection, WindowPage, scan_from, window};
use crate::query::operators::{CompiledQuery, OrderKey};
use crate::storage::table::{RowChange, TableSnapshot};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// The `[offset, offset + limit)` slice of a query a session keeps live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub offset: usize,
    pub limit: usize,
}

/// Moves a session's window from `before` to `after`.
///
/// Index-ordered windows are patched from the changed rows alone: the old
/// window's first and last keys bound the region that can shift, rows that
/// cross the leading edge are found by scanning backwards from it, and slots
/// vacated at the trailing edge are refilled by scanning forwards past it.
/// Relevance order and large transactions re-run the window instead.
pub fn advance(
    before: &TableSnapshot,
    after: &TableSnapshot,
    compiled: &CompiledQuery,
    changes: &[RowChange],
    old: &WindowPage,
    bounds: WindowBounds,
    max_incremental_changes: usize,
) -> Result<WindowPage, QueryError> {
    if changes.is_empty() {
        return Ok(old.clone());
    }
    if compiled.has_index_order()
        && changes.len() <= max_incremental_changes
        && let Some(page) = incremental(before, after, compiled, changes, old, bounds)?
    {
        return Ok(page);
    }
    window(after, compiled, bounds.offset, bounds.limit)
}

fn key_in(table: &TableSnapshot, compiled: &CompiledQuery, key: &PrimaryKey) -> Option<OrderKey> {
    table.row(key).and_then(|row| compiled.key_of(key, row))
}

/// `None` when the old window does not line up with `before`; the caller
/// recomputes.
fn incremental(
    before: &TableSnapshot,
    after: &TableSnapshot,
    compiled: &CompiledQuery,
    changes: &[RowChange],
    old: &WindowPage,
    bounds: WindowBounds,
) -> Result<Option<WindowPage>, QueryError> {
    let WindowBounds { offset, limit } = bounds;
    let changed: HashSet<&PrimaryKey> = changes.iter().map(|c| &c.key).collect();
    let left: Vec<OrderKey> = changes
        .iter()
        .filter_map(|c| c.before.as_ref().and_then(|row| compiled.key_of(&c.key, row)))
        .collect();
    let entered: Vec<OrderKey> = changes
        .iter()
        .filter_map(|c| c.after.as_ref().and_then(|row| compiled.key_of(&c.key, row)))
        .collect();
    let Some(total) = old
        .total
        .checked_sub(left.len() as u64)
        .map(|t| t + entered.len() as u64)
    else {
        return Ok(None);
    };
    let expected_len = (total.saturating_sub(offset as u64)).min(limit as u64) as usize;

    let (Some(first), Some(last)) = (old.keys.first(), old.keys.last()) else {
        return Ok((expected_len == 0).then(|| WindowPage {
            keys: Vec::new(),
            total,
        }));
    };
    let (Some(start), Some(end)) = (key_in(before, compiled, first), key_in(before, compiled, last)) else {
        return Ok(None);
    };
    let below = |k: &OrderKey| compiled.compare(k, &start) == Ordering::Less;

    // Number of matches ordered before `start` once the transaction applies.
    let Some(lead) = (offset + entered.iter().filter(|k| below(k)).count())
        .checked_sub(left.iter().filter(|k| below(k)).count())
    else {
        return Ok(None);
    };

    let mut keys: Vec<PrimaryKey> = Vec::with_capacity(limit);
    if lead > offset {
        let wanted = lead - offset;
        let mut pulled = Vec::with_capacity(wanted);
        scan_from(after, compiled, Some(&start), ScanDirection::Backward, |k| {
            pulled.push(k.key);
            pulled.len() < wanted
        })?;
        if pulled.len() < wanted {
            return Ok(None);
        }
        pulled.reverse();
        pulled.truncate(limit);
        keys = pulled;
    }

    let need = limit - keys.len();
    if need > 0 {
        let skip = offset.saturating_sub(lead);
        let mut rest: Vec<OrderKey> = Vec::with_capacity(old.keys.len() + entered.len());
        for key in &old.keys {
            if changed.contains(key) {
                continue;
            }
            let Some(k) = key_in(after, compiled, key) else {
                return Ok(None);
            };
            rest.push(k);
        }
        rest.extend(entered.iter().filter(|k| !below(k)).cloned());
        if old.total > (offset + old.keys.len()) as u64 {
            let wanted = skip + need;
            let mut found = 0usize;
            scan_from(before, compiled, Some(&end), ScanDirection::Forward, |k| {
                if changed.contains(&k.key) {
                    return true;
                }
                rest.push(k);
                found += 1;
                found < wanted
            })?;
        }
        rest.sort_by(|a, b| compiled.compare(a, b));
        keys.extend(rest.into_iter().skip(skip).take(need).map(|k| k.key));
    }

    if keys.len() != expected_len {
        return Ok(None);
    }
    Ok(Some(WindowPage { keys, total }))
}

/// Row-level difference between two windows, in the shape a delta carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowDiff {
    /// `(new index, key)`.
    pub inserted: Vec<(usize, PrimaryKey)>,
    pub removed: Vec<PrimaryKey>,
    /// Rows present in both windows whose values changed.
    pub updated: Vec<PrimaryKey>,
    pub moved: Vec<MovedRow>,
}

impl WindowDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty() && self.updated.is_empty() && self.moved.is_empty()
    }
}

/// Rows kept in both windows count as moved only when they fall outside the
/// longest run that kept its relative order, so a single insertion never
/// reports the rows it pushed down.
pub fn diff<F>(old: &[PrimaryKey], new: &[PrimaryKey], is_updated: F) -> WindowDiff
where
    F: Fn(&PrimaryKey) -> bool,
{
    let old_index: HashMap<&PrimaryKey, usize> = old.iter().enumerate().map(|(i, k)| (k, i)).collect();
    let present: HashSet<&PrimaryKey> = new.iter().collect();

    let mut out = WindowDiff {
        removed: old.iter().filter(|k| !present.contains(k)).cloned().collect(),
        ..WindowDiff::default()
    };
    let mut kept: Vec<(usize, usize, &PrimaryKey)> = Vec::new();
    for (to, key) in new.iter().enumerate() {
        match old_index.get(key) {
            Some(&from) => kept.push((from, to, key)),
            None => out.inserted.push((to, key.clone())),
        }
    }

    let froms: Vec<usize> = kept.iter().map(|(from, _, _)| *from).collect();
    let stable = longest_increasing(&froms);
    for (i, (from, to, key)) in kept.into_iter().enumerate() {
        if !stable[i] {
            out.moved.push(MovedRow {
                key: key.clone(),
                from,
                to,
            });
        }
        if is_updated(key) {
            out.updated.push(key.clone());
        }
    }
    out
}

/// Marks one longest strictly increasing subsequence of `seq`.
fn longest_increasing(seq: &[usize]) -> Vec<bool> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (i, &v) in seq.iter().enumerate() {
        let pos = tails.partition_point(|&t| seq[t] < v);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }
    let mut keep = vec![false; seq.len()];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        keep[i] = true;
        cursor = prev[i];
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::{WindowBounds, advance, diff, longest_increasing};
    use crate::catalog::TableDescriptor;
    use crate::catalog::schema::{ColumnConfig, FilterKind, SortKind, TableConfig};
    use crate::catalog::types::{ColumnType, PrimaryKey};
    use crate::ingest::event::{ChangeEvent, Transaction};
    use crate::protocol::{DeltaMessage, InsertedRow, WireRow, apply_delta};
    use crate::query::executor::window;
    use crate::query::operators::CompiledQuery;
    use crate::query::plan::QuerySpec;
    use crate::row_image;
    use crate::storage::search::SearchOptions;
    use crate::storage::sort::Direction;
    use crate::storage::table::{TableSnapshot, TableStore};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn store() -> TableStore {
        let config = TableConfig::new("jobs", "id")
            .column(ColumnConfig::new("id", ColumnType::Integer).sortable(SortKind::Numeric))
            .column(ColumnConfig::new("queue", ColumnType::Text).filterable(FilterKind::Categorical))
            .column(
                ColumnConfig::new("priority", ColumnType::Integer)
                    .sortable(SortKind::Numeric)
                    .filterable(FilterKind::NumericRange),
            );
        TableStore::new(Arc::new(TableDescriptor::resolve(&config).expect("descriptor")))
    }

    fn compile(table: &TableSnapshot, spec: &QuerySpec) -> CompiledQuery {
        CompiledQuery::compile(&table.descriptor, spec, None, SearchOptions::default()).expect("compile")
    }

    fn ids(keys: &[PrimaryKey]) -> Vec<i64> {
        keys.iter()
            .filter_map(|k| match k.value() {
                crate::catalog::types::Value::Integer(i) => Some(*i),
                _ => None,
            })
            .collect()
    }

    fn job(id: i64, queue: &str, priority: i64) -> ChangeEvent {
        ChangeEvent::insert(row_image! { "id" => id, "queue" => queue, "priority" => priority })
    }

    #[test]
    fn insert_ahead_of_window_evicts_trailing_row() {
        let store = store();
        store
            .apply(&Transaction::new("jobs", 1, vec![job(1, "a", 0), job(2, "a", 0)]))
            .expect("apply");
        let spec = QuerySpec::new().limit(2);
        let head = store.head();
        let compiled = compile(&head, &spec);
        let bounds = WindowBounds { offset: 0, limit: 2 };
        let old = window(&head, &compiled, 0, 2).expect("window");
        assert_eq!(ids(&old.keys), vec![1, 2]);

        let applied = store
            .apply(&Transaction::new("jobs", 2, vec![job(0, "a", 0)]))
            .expect("apply")
            .expect("applied");
        let new = advance(&applied.before, &applied.after, &compiled, &applied.changes, &old, bounds, 64)
            .expect("advance");
        assert_eq!(ids(&new.keys), vec![0, 1]);
        assert_eq!(new.total, 3);

        let d = diff(&old.keys, &new.keys, |_| false);
        assert_eq!(d.inserted, vec![(0, PrimaryKey::from(0i64))]);
        assert_eq!(d.removed, vec![PrimaryKey::from(2i64)]);
        assert!(d.moved.is_empty());
    }

    #[test]
    fn rank_change_moves_only_the_changed_row() {
        let store = store();
        let rows = (1..=5).map(|i| job(i, "a", i * 10)).collect();
        store.apply(&Transaction::new("jobs", 1, rows)).expect("apply");
        let spec = QuerySpec::new().order_by("priority", Direction::Desc).limit(4);
        let head = store.head();
        let compiled = compile(&head, &spec);
        let old = window(&head, &compiled, 0, 4).expect("window");
        assert_eq!(ids(&old.keys), vec![5, 4, 3, 2]);

        let applied = store
            .apply(&Transaction::new(
                "jobs",
                2,
                vec![ChangeEvent::update(row_image! { "id" => 2i64, "queue" => "a", "priority" => 99i64 })],
            ))
            .expect("apply")
            .expect("applied");
        let new = advance(
            &applied.before,
            &applied.after,
            &compiled,
            &applied.changes,
            &old,
            WindowBounds { offset: 0, limit: 4 },
            64,
        )
        .expect("advance");
        assert_eq!(ids(&new.keys), vec![2, 5, 4, 3]);
        let changed: HashSet<PrimaryKey> = applied.changes.iter().map(|c| c.key.clone()).collect();
        let d = diff(&old.keys, &new.keys, |k| changed.contains(k));
        assert_eq!(d.moved.len(), 1);
        assert_eq!(d.moved[0].key, PrimaryKey::from(2i64));
        assert_eq!((d.moved[0].from, d.moved[0].to), (3, 0));
        assert_eq!(d.updated, vec![PrimaryKey::from(2i64)]);
    }

    #[test]
    fn longest_run_prefers_the_unmoved_majority() {
        assert_eq!(longest_increasing(&[3, 0, 1, 2]), vec![false, true, true, true]);
        assert_eq!(longest_increasing(&[]), Vec::<bool>::new());
        assert_eq!(longest_increasing(&[0, 1, 2]), vec![true; 3]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put { id: i64, queue: bool, priority: i64 },
        Delete { id: i64 },
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..40i64, any::<bool>(), 0..8i64).prop_map(|(id, queue, priority)| Op::Put { id, queue, priority }),
            1 => (0..40i64).prop_map(|id| Op::Delete { id }),
        ]
    }

    fn arb_spec() -> impl Strategy<Value = QuerySpec> {
        (0..3u8, 0..3u8, 0..8usize, 1..6usize).prop_map(|(filter, order, offset, limit)| {
            let spec = QuerySpec::new().offset(offset).limit(limit);
            let spec = match filter {
                0 => spec,
                1 => spec.filter_eq("queue", "a"),
                _ => spec.filter_range(
                    "priority",
                    Some(crate::catalog::types::Value::from(2i64)),
                    Some(crate::catalog::types::Value::from(5i64)),
                ),
            };
            match order {
                0 => spec,
                1 => spec.order_by("priority", Direction::Asc),
                _ => spec.order_by("priority", Direction::Desc),
            }
        })
    }

    fn event(op: &Op) -> ChangeEvent {
        match op {
            Op::Put { id, queue, priority } => ChangeEvent::update(row_image! {
                "id" => *id,
                "queue" => if *queue { "a" } else { "b" },
                "priority" => *priority,
            }),
            Op::Delete { id } => ChangeEvent::delete(*id),
        }
    }

    fn wire(table: &TableSnapshot, keys: &[PrimaryKey]) -> Vec<WireRow> {
        keys.iter()
            .filter_map(|k| table.row(k).map(|row| WireRow::from_row(&table.descriptor, row)))
            .collect()
    }

    proptest! {
        #[test]
        fn incremental_window_matches_fresh_query(
            seed in prop::collection::vec(arb_op(), 0..40),
            txns in prop::collection::vec(prop::collection::vec(arb_op(), 1..5), 1..12),
            spec in arb_spec(),
        ) {
            let store = store();
            let seed: Vec<ChangeEvent> = seed.iter().map(event).collect();
            store.apply(&Transaction::new("jobs", 1, seed)).expect("seed");
            let head = store.head();
            let compiled = compile(&head, &spec);
            let bounds = WindowBounds {
                offset: spec.offset.unwrap_or(0),
                limit: spec.limit.unwrap_or(0),
            };
            let mut current = window(&head, &compiled, bounds.offset, bounds.limit).expect("window");
            let mut rows = wire(&head, &current.keys);

            for (i, txn) in txns.iter().enumerate() {
                let events = txn.iter().map(event).collect();
                let Some(applied) = store
                    .apply(&Transaction::new("jobs", 2 + i as u64, events))
                    .expect("apply")
                else {
                    continue;
                };
                let next = advance(&applied.before, &applied.after, &compiled, &applied.changes, &current, bounds, 64)
                    .expect("advance");
                let fresh = window(&applied.after, &compiled, bounds.offset, bounds.limit).expect("window");
                prop_assert_eq!(&next, &fresh);

                let changed: HashSet<PrimaryKey> = applied.changes.iter().map(|c| c.key.clone()).collect();
                let d = diff(&current.keys, &next.keys, |k| changed.contains(k));
                let delta = DeltaMessage {
                    session_id: 1,
                    position: applied.after.position,
                    inserted: d
                        .inserted
                        .iter()
                        .filter_map(|(index, key)| {
                            applied.after.row(key).map(|row| InsertedRow {
                                index: *index,
                                row: WireRow::from_row(&applied.after.descriptor, row),
                            })
                        })
                        .collect(),
                    removed: d.removed.clone(),
                    updated: wire(&applied.after, &d.updated),
                    moved: d.moved.clone(),
                    total: Some(next.total),
                    facets: None,
                };
                rows = apply_delta(&rows, &delta).expect("apply delta");
                prop_assert_eq!(&rows, &wire(&applied.after, &next.keys));
                current = next;
            }
        }
    }
}
