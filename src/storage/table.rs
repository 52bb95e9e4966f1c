use crate::catalog::TableDescriptor;
use crate::catalog::schema::FilterKind;
use crate::catalog::types::{PrimaryKey, Row};
use crate::error::LiveIndexError;
use crate::ingest::event::{ChangeEvent, LogPosition, Transaction};
use crate::storage::index::SecondaryIndex;
use crate::storage::search::SearchIndex;
use crate::storage::sort::SortIndex;
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Net effect of one transaction on one primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub key: PrimaryKey,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

/// An immutable, internally consistent view of one table: rows and every
/// derived index at the same log position.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub descriptor: Arc<TableDescriptor>,
    pub rows: OrdMap<PrimaryKey, Row>,
    sort: Vec<Option<SortIndex>>,
    search: Vec<Option<SearchIndex>>,
    filters: Vec<Option<SecondaryIndex>>,
    pub position: LogPosition,
    /// Incremented on every publish, including ones that change no rows.
    pub version: u64,
}

impl TableSnapshot {
    pub fn empty(descriptor: Arc<TableDescriptor>) -> Self {
        let sort = descriptor
            .columns
            .iter()
            .map(|c| c.sort.map(|_| SortIndex::default()))
            .collect();
        let search = descriptor
            .columns
            .iter()
            .map(|c| c.searchable.then(SearchIndex::default))
            .collect();
        let filters = descriptor
            .columns
            .iter()
            .map(|c| c.filter.map(|kind| SecondaryIndex::for_filter(c.position, kind)))
            .collect();
        Self {
            descriptor,
            rows: OrdMap::new(),
            sort,
            search,
            filters,
            position: LogPosition::ZERO,
            version: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, key: &PrimaryKey) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn sort_index(&self, column: usize) -> Option<&SortIndex> {
        self.sort.get(column).and_then(Option::as_ref)
    }

    pub fn search_index(&self, column: usize) -> Option<&SearchIndex> {
        self.search.get(column).and_then(Option::as_ref)
    }

    pub fn filter_index(&self, column: usize) -> Option<&SecondaryIndex> {
        self.filters.get(column).and_then(Option::as_ref)
    }

    /// Categorical index for `column`, the source of its facet counts.
    pub fn categorical_index(&self, column: usize) -> Option<&SecondaryIndex> {
        let col = self.descriptor.columns.get(column)?;
        if col.filter != Some(FilterKind::Categorical) {
            return None;
        }
        self.filter_index(column)
    }

    /// Replaces the row stored under `key` and every index entry derived
    /// from it. Rows and indexes are only ever mutated together, here.
    fn replace_row(&mut self, key: &PrimaryKey, before: Option<&Row>, after: Option<&Row>) {
        let descriptor = Arc::clone(&self.descriptor);
        for col in &descriptor.columns {
            let old = before.map(|r| r.get(col.position));
            let new = after.map(|r| r.get(col.position));
            if old == new {
                continue;
            }
            if let Some(idx) = self.sort[col.position].as_mut() {
                if let Some(v) = old {
                    idx.remove(v, key);
                }
                if let Some(v) = new {
                    idx.insert(v.clone(), key.clone());
                }
            }
            if let Some(idx) = self.search[col.position].as_mut() {
                if let Some(v) = old {
                    idx.remove(v, key);
                }
                if let Some(v) = new {
                    idx.insert(v, key);
                }
            }
            if let Some(idx) = self.filters[col.position].as_mut() {
                if let Some(v) = old {
                    idx.remove(v, key);
                }
                if let Some(v) = new {
                    idx.insert(v.clone(), key.clone());
                }
            }
        }
        match after {
            Some(row) => {
                self.rows.insert(key.clone(), row.clone());
            }
            None => {
                self.rows.remove(key);
            }
        }
    }

    /// Applies net per-key effects, returning the ones that changed anything.
    fn apply_net(&mut self, net: BTreeMap<PrimaryKey, Option<Row>>) -> Vec<RowChange> {
        let mut changes = Vec::with_capacity(net.len());
        for (key, after) in net {
            let before = self.rows.get(&key).cloned();
            if before == after {
                continue;
            }
            self.replace_row(&key, before.as_ref(), after.as_ref());
            changes.push(RowChange { key, before, after });
        }
        changes
    }
}

/// Result of publishing a new table snapshot.
#[derive(Debug, Clone)]
pub struct AppliedTransaction {
    pub before: Arc<TableSnapshot>,
    pub after: Arc<TableSnapshot>,
    pub changes: Vec<RowChange>,
}

impl AppliedTransaction {
    pub fn position(&self) -> LogPosition {
        self.after.position
    }
}

/// Owner of one table's current snapshot.
///
/// Readers clone the head `Arc` and never block the writer for longer than
/// the pointer swap. Writers are serialized and build each new snapshot from
/// a structural-sharing clone of the previous one, so a transaction becomes
/// visible all at once or not at all.
#[derive(Debug)]
pub struct TableStore {
    descriptor: Arc<TableDescriptor>,
    head: RwLock<Arc<TableSnapshot>>,
    writer: Mutex<()>,
}

impl TableStore {
    pub fn new(descriptor: Arc<TableDescriptor>) -> Self {
        let empty = TableSnapshot::empty(Arc::clone(&descriptor));
        Self {
            descriptor,
            head: RwLock::new(Arc::new(empty)),
            writer: Mutex::new(()),
        }
    }

    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }

    pub fn head(&self) -> Arc<TableSnapshot> {
        Arc::clone(&self.head.read())
    }

    pub fn position(&self) -> LogPosition {
        self.head.read().position
    }

    fn publish(
        &self,
        before: Arc<TableSnapshot>,
        mut next: TableSnapshot,
        changes: Vec<RowChange>,
    ) -> AppliedTransaction {
        next.version = before.version + 1;
        let after = Arc::new(next);
        *self.head.write() = Arc::clone(&after);
        AppliedTransaction {
            before,
            after,
            changes,
        }
    }

    /// Applies a committed transaction. Transactions at or below the applied
    /// position are redeliveries and return `Ok(None)`.
    pub fn apply(&self, txn: &Transaction) -> Result<Option<AppliedTransaction>, LiveIndexError> {
        let _writer = self.writer.lock();
        let before = self.head();
        if txn.position <= before.position {
            debug!(
                table = %self.descriptor.name,
                position = txn.position.get(),
                applied = before.position.get(),
                "skipping already applied transaction"
            );
            return Ok(None);
        }

        let net = self.resolve_events(&txn.events)?;
        let mut next = (*before).clone();
        let changes = next.apply_net(net);
        next.position = txn.position;
        Ok(Some(self.publish(before, next, changes)))
    }

    /// Later events for the same key override earlier ones.
    fn resolve_events(&self, events: &[ChangeEvent]) -> Result<BTreeMap<PrimaryKey, Option<Row>>, LiveIndexError> {
        let mut net = BTreeMap::new();
        for event in events {
            match event {
                ChangeEvent::Insert { row } => {
                    let row = self.descriptor.row_from_image(row)?;
                    net.insert(self.descriptor.primary_key_of(&row), Some(row));
                }
                ChangeEvent::Update { old_key, row } => {
                    let row = self.descriptor.row_from_image(row)?;
                    let key = self.descriptor.primary_key_of(&row);
                    if let Some(old) = old_key
                        && *old != key
                    {
                        net.insert(old.clone(), None);
                    }
                    net.insert(key, Some(row));
                }
                ChangeEvent::Delete { key } => {
                    net.insert(key.clone(), None);
                }
            }
        }
        Ok(net)
    }

    /// Upserts a batch of snapshot rows without moving the log position.
    pub fn load_rows(&self, rows: Vec<Row>) -> AppliedTransaction {
        let _writer = self.writer.lock();
        let before = self.head();
        let net: BTreeMap<PrimaryKey, Option<Row>> = rows
            .into_iter()
            .map(|row| (self.descriptor.primary_key_of(&row), Some(row)))
            .collect();
        let mut next = (*before).clone();
        let changes = next.apply_net(net);
        self.publish(before, next, changes)
    }

    /// Marks the table as caught up to `position` after a snapshot load.
    pub fn advance_to(&self, position: LogPosition) -> AppliedTransaction {
        let _writer = self.writer.lock();
        let before = self.head();
        let mut next = (*before).clone();
        next.position = next.position.max(position);
        self.publish(before, next, Vec::new())
    }

    /// Replaces the whole row set, e.g. when restoring a checkpoint. Every
    /// row that differs from the current state is reported as a change.
    pub fn replace_all(&self, rows: Vec<Row>, position: LogPosition) -> AppliedTransaction {
        let _writer = self.writer.lock();
        let before = self.head();
        let mut net: BTreeMap<PrimaryKey, Option<Row>> =
            before.rows.keys().map(|k| (k.clone(), None)).collect();
        for row in rows {
            net.insert(self.descriptor.primary_key_of(&row), Some(row));
        }
        let mut next = (*before).clone();
        let changes = next.apply_net(net);
        next.position = position;
        self.publish(before, next, changes)
    }

    /// Drops every row ahead of a fresh snapshot load. This is the only
    /// operation that moves the position backwards.
    pub fn reset(&self) -> AppliedTransaction {
        self.replace_all(Vec::new(), LogPosition::ZERO)
    }
}
