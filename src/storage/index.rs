use crate::catalog::schema::FilterKind;
use crate::catalog::types::{PrimaryKey, Value};
use im::{HashMap, OrdMap, OrdSet};
use std::collections::BTreeSet;
use std::ops::Bound;

#[derive(Debug, Clone)]
pub enum SecondaryIndexStore {
    /// Exact-value lookups; also the source of facet counts.
    Hash(HashMap<Value, OrdSet<PrimaryKey>>),
    /// Ordered store for range filters. Nulls are not indexed.
    BTree(OrdMap<Value, OrdSet<PrimaryKey>>),
}

/// Filter index over one column.
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    pub column: usize,
    pub store: SecondaryIndexStore,
}

impl SecondaryIndex {
    pub fn for_filter(column: usize, kind: FilterKind) -> Self {
        let store = if kind.is_range() {
            SecondaryIndexStore::BTree(OrdMap::new())
        } else {
            SecondaryIndexStore::Hash(HashMap::new())
        };
        Self { column, store }
    }

    pub fn insert(&mut self, key: Value, pk: PrimaryKey) {
        match &mut self.store {
            SecondaryIndexStore::BTree(entries) => {
                if key.is_null() {
                    return;
                }
                let mut pks = entries.get(&key).cloned().unwrap_or_default();
                pks.insert(pk);
                entries.insert(key, pks);
            }
            SecondaryIndexStore::Hash(entries) => {
                let mut pks = entries.get(&key).cloned().unwrap_or_default();
                pks.insert(pk);
                entries.insert(key, pks);
            }
        }
    }

    pub fn remove(&mut self, key: &Value, pk: &PrimaryKey) {
        match &mut self.store {
            SecondaryIndexStore::BTree(entries) => {
                let Some(mut pks) = entries.get(key).cloned() else {
                    return;
                };
                pks.remove(pk);
                if pks.is_empty() {
                    entries.remove(key);
                } else {
                    entries.insert(key.clone(), pks);
                }
            }
            SecondaryIndexStore::Hash(entries) => {
                let Some(mut pks) = entries.get(key).cloned() else {
                    return;
                };
                pks.remove(pk);
                if pks.is_empty() {
                    entries.remove(key);
                } else {
                    entries.insert(key.clone(), pks);
                }
            }
        }
    }

    pub fn get(&self, key: &Value) -> Option<&OrdSet<PrimaryKey>> {
        match &self.store {
            SecondaryIndexStore::BTree(entries) => entries.get(key),
            SecondaryIndexStore::Hash(entries) => entries.get(key),
        }
    }

    pub fn count_eq(&self, key: &Value) -> usize {
        self.get(key).map(|pks| pks.len()).unwrap_or(0)
    }

    pub fn scan_in(&self, keys: &[Value]) -> BTreeSet<PrimaryKey> {
        keys.iter()
            .filter_map(|k| self.get(k))
            .flat_map(|pks| pks.iter().cloned())
            .collect()
    }

    /// Returns `None` for hash stores, which cannot answer ranges.
    pub fn scan_range(&self, start: Bound<Value>, end: Bound<Value>) -> Option<BTreeSet<PrimaryKey>> {
        match &self.store {
            SecondaryIndexStore::BTree(entries) => {
                if range_is_empty(&start, &end) {
                    return Some(BTreeSet::new());
                }
                Some(
                    entries
                        .range((start, end))
                        .flat_map(|(_, pks)| pks.iter().cloned())
                        .collect(),
                )
            }
            SecondaryIndexStore::Hash(_) => None,
        }
    }

    /// Distinct indexed values, in no particular order for hash stores.
    pub fn values(&self) -> Vec<Value> {
        match &self.store {
            SecondaryIndexStore::BTree(entries) => entries.keys().cloned().collect(),
            SecondaryIndexStore::Hash(entries) => entries.keys().cloned().collect(),
        }
    }
}

// OrdMap::range panics on inverted bounds, as BTreeMap::range does.
fn range_is_empty(start: &Bound<Value>, end: &Bound<Value>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e))
        | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
        _ => false,
    }
}
