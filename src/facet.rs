use crate::catalog::SecurityScope;
use crate::catalog::types::{PrimaryKey, Value};
use crate::storage::index::SecondaryIndex;
use crate::storage::table::{RowChange, TableSnapshot};
use im::OrdSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetBucket {
    pub value: Value,
    pub count: u64,
}

/// Column name to its non-empty buckets, ordered by value.
pub type FacetSnapshot = BTreeMap<String, Vec<FacetBucket>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetChange {
    pub value: Value,
    pub from: u64,
    pub to: u64,
}

impl FacetChange {
    /// The value disappeared from the facet.
    pub fn is_removal(&self) -> bool {
        self.to == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetDelta {
    pub columns: BTreeMap<String, Vec<FacetChange>>,
}

impl FacetDelta {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn change(&self, column: &str, value: &Value) -> Option<&FacetChange> {
        self.columns.get(column)?.iter().find(|c| &c.value == value)
    }

    /// Folds this delta into a snapshot taken at the delta's starting point.
    pub fn apply_to(&self, snapshot: &mut FacetSnapshot) {
        for (column, changes) in &self.columns {
            let buckets = snapshot.entry(column.clone()).or_default();
            for change in changes {
                match buckets.binary_search_by(|b| b.value.cmp(&change.value)) {
                    Ok(pos) if change.to == 0 => {
                        buckets.remove(pos);
                    }
                    Ok(pos) => buckets[pos].count = change.to,
                    Err(_) if change.to == 0 => {}
                    Err(pos) => buckets.insert(
                        pos,
                        FacetBucket {
                            value: change.value.clone(),
                            count: change.to,
                        },
                    ),
                }
            }
            if buckets.is_empty() {
                snapshot.remove(column);
            }
        }
    }
}

/// Facet counts are not stored separately: each categorical index already
/// maps a value to its row set, so a count is the size of that set at the
/// snapshot's position. Scoped counts restrict the set to rows a security
/// scope allows.
pub struct FacetAggregator;

impl FacetAggregator {
    pub fn snapshot(table: &TableSnapshot, scope: Option<&SecurityScope>) -> FacetSnapshot {
        let mut out = FacetSnapshot::new();
        for col in table.descriptor.categorical_columns() {
            let Some(index) = table.categorical_index(col.position) else {
                continue;
            };
            let mut buckets: Vec<FacetBucket> = index
                .values()
                .into_iter()
                .filter(|v| !v.is_null())
                .filter_map(|value| {
                    let count = Self::count(table, index, &value, scope);
                    (count > 0).then_some(FacetBucket { value, count })
                })
                .collect();
            if buckets.is_empty() {
                continue;
            }
            buckets.sort_by(|a, b| a.value.cmp(&b.value));
            out.insert(col.name.clone(), buckets);
        }
        out
    }

    /// Count changes caused by `changes`, comparing the two snapshots the
    /// transaction moved between.
    pub fn diff(
        before: &TableSnapshot,
        after: &TableSnapshot,
        changes: &[RowChange],
        scope: Option<&SecurityScope>,
    ) -> FacetDelta {
        let mut delta = FacetDelta::default();
        for col in after.descriptor.categorical_columns() {
            let mut touched = BTreeSet::new();
            for change in changes {
                let old = change.before.as_ref().map(|r| r.get(col.position));
                let new = change.after.as_ref().map(|r| r.get(col.position));
                let visibility_changed = scope.is_some_and(|s| {
                    change.before.as_ref().is_some_and(|r| s.allows(r))
                        != change.after.as_ref().is_some_and(|r| s.allows(r))
                });
                if old == new && !visibility_changed {
                    continue;
                }
                touched.extend(old.into_iter().chain(new).filter(|v| !v.is_null()).cloned());
            }

            let (Some(old_index), Some(new_index)) = (
                before.categorical_index(col.position),
                after.categorical_index(col.position),
            ) else {
                continue;
            };
            let column_changes: Vec<FacetChange> = touched
                .into_iter()
                .filter_map(|value| {
                    let from = Self::count(before, old_index, &value, scope);
                    let to = Self::count(after, new_index, &value, scope);
                    (from != to).then_some(FacetChange { value, from, to })
                })
                .collect();
            if !column_changes.is_empty() {
                delta.columns.insert(col.name.clone(), column_changes);
            }
        }
        delta
    }

    fn count(
        table: &TableSnapshot,
        index: &SecondaryIndex,
        value: &Value,
        scope: Option<&SecurityScope>,
    ) -> u64 {
        let Some(members) = index.get(value) else {
            return 0;
        };
        let Some(scope) = scope else {
            return members.len() as u64;
        };
        match table.categorical_index(scope.column).and_then(|idx| idx.get(&scope.value)) {
            Some(visible) => intersection_len(members, visible),
            None if table.categorical_index(scope.column).is_some() => 0,
            None => members
                .iter()
                .filter(|pk| table.row(pk).is_some_and(|row| scope.allows(row)))
                .count() as u64,
        }
    }
}

fn intersection_len(a: &OrdSet<PrimaryKey>, b: &OrdSet<PrimaryKey>) -> u64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().filter(|pk| large.contains(pk)).count() as u64
}

#[cfg(test)]
mod tests {
    use super::{FacetAggregator, FacetSnapshot};
    use crate::catalog::schema::{ColumnConfig, FilterKind, TableConfig};
    use crate::catalog::types::{ColumnType, Value};
    use crate::catalog::{SecurityScope, TableDescriptor};
    use crate::ingest::event::{ChangeEvent, Transaction};
    use crate::row_image;
    use crate::storage::table::TableStore;
    use std::sync::Arc;

    fn store() -> TableStore {
        let config = TableConfig::new("logs", "id")
            .column(ColumnConfig::new("id", ColumnType::Integer))
            .column(ColumnConfig::new("version", ColumnType::Text).filterable(FilterKind::Categorical))
            .column(ColumnConfig::new("tenant", ColumnType::Text).filterable(FilterKind::Categorical));
        TableStore::new(Arc::new(TableDescriptor::resolve(&config).expect("descriptor")))
    }

    fn counts(snapshot: &FacetSnapshot, column: &str) -> Vec<(String, u64)> {
        snapshot
            .get(column)
            .map(|buckets| {
                buckets
                    .iter()
                    .map(|b| (b.value.as_text().unwrap_or_default().to_string(), b.count))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn update_moves_count_between_values() {
        let store = store();
        store
            .apply(&Transaction::new(
                "logs",
                1,
                vec![
                    ChangeEvent::insert(row_image! { "id" => 1i64, "version" => "1.0", "tenant" => "a" }),
                    ChangeEvent::insert(row_image! { "id" => 2i64, "version" => "2.0", "tenant" => "b" }),
                ],
            ))
            .expect("apply");
        let applied = store
            .apply(&Transaction::new(
                "logs",
                2,
                vec![ChangeEvent::update(row_image! { "id" => 1i64, "version" => "2.0", "tenant" => "a" })],
            ))
            .expect("apply")
            .expect("applied");

        let delta = FacetAggregator::diff(&applied.before, &applied.after, &applied.changes, None);
        let removed = delta.change("version", &Value::from("1.0")).expect("1.0");
        assert_eq!((removed.from, removed.to), (1, 0));
        assert!(removed.is_removal());
        let grown = delta.change("version", &Value::from("2.0")).expect("2.0");
        assert_eq!((grown.from, grown.to), (1, 2));
        assert!(!delta.columns.contains_key("tenant"));

        let mut folded = FacetAggregator::snapshot(&applied.before, None);
        delta.apply_to(&mut folded);
        assert_eq!(folded, FacetAggregator::snapshot(&applied.after, None));
        assert_eq!(counts(&folded, "version"), vec![("2.0".to_string(), 2)]);
    }

    #[test]
    fn scoped_counts_only_see_visible_rows() {
        let store = store();
        let applied = store
            .apply(&Transaction::new(
                "logs",
                1,
                vec![
                    ChangeEvent::insert(row_image! { "id" => 1i64, "version" => "1.0", "tenant" => "a" }),
                    ChangeEvent::insert(row_image! { "id" => 2i64, "version" => "1.0", "tenant" => "b" }),
                ],
            ))
            .expect("apply")
            .expect("applied");
        let scope = SecurityScope {
            column: 2,
            value: Value::from("a"),
        };
        let scoped = FacetAggregator::snapshot(&applied.after, Some(&scope));
        assert_eq!(counts(&scoped, "version"), vec![("1.0".to_string(), 1)]);
        assert_eq!(counts(&scoped, "tenant"), vec![("a".to_string(), 1)]);

        let delta = FacetAggregator::diff(&applied.before, &applied.after, &applied.changes, Some(&scope));
        let change = delta.change("version", &Value::from("1.0")).expect("change");
        assert_eq!((change.from, change.to), (0, 1));
    }
}
