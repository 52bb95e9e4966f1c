use crate::catalog::types::{PrimaryKey, Value};
use im::Vector;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortEntry {
    pub value: Value,
    pub key: PrimaryKey,
}

/// Value order used by sort indexes: like `Value::cmp`, except that nulls
/// sort after every other value.
pub fn compare_sort_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// Total order of `(value, key)` pairs for one direction. Ties on value are
/// broken by primary key ascending regardless of direction.
pub fn compare_entries(
    direction: Direction,
    a_value: &Value,
    a_key: &PrimaryKey,
    b_value: &Value,
    b_key: &PrimaryKey,
) -> Ordering {
    let by_value = match direction {
        Direction::Asc => compare_sort_values(a_value, b_value),
        Direction::Desc => compare_sort_values(b_value, a_value),
    };
    by_value.then_with(|| a_key.cmp(b_key))
}

/// One ordered structure per sortable column, kept in both directions so
/// that either direction is a plain forward walk with primary-key tie-breaks.
///
/// Both vectors are persistent: cloning the index for a new table snapshot
/// is O(1), and insert/remove at a binary-searched position is O(log n).
#[derive(Debug, Clone, Default)]
pub struct SortIndex {
    asc: Vector<SortEntry>,
    desc: Vector<SortEntry>,
}

impl SortIndex {
    pub fn len(&self) -> usize {
        self.asc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.asc.is_empty()
    }

    fn ordered(&self, direction: Direction) -> &Vector<SortEntry> {
        match direction {
            Direction::Asc => &self.asc,
            Direction::Desc => &self.desc,
        }
    }

    fn search(
        entries: &Vector<SortEntry>,
        direction: Direction,
        value: &Value,
        key: &PrimaryKey,
    ) -> Result<usize, usize> {
        entries.binary_search_by(|probe| {
            compare_entries(direction, &probe.value, &probe.key, value, key)
        })
    }

    pub fn insert(&mut self, value: Value, key: PrimaryKey) {
        for direction in [Direction::Asc, Direction::Desc] {
            let entries = match direction {
                Direction::Asc => &mut self.asc,
                Direction::Desc => &mut self.desc,
            };
            if let Err(pos) = Self::search(entries, direction, &value, &key) {
                entries.insert(
                    pos,
                    SortEntry {
                        value: value.clone(),
                        key: key.clone(),
                    },
                );
            }
        }
    }

    pub fn remove(&mut self, value: &Value, key: &PrimaryKey) -> bool {
        let mut removed = false;
        for direction in [Direction::Asc, Direction::Desc] {
            let entries = match direction {
                Direction::Asc => &mut self.asc,
                Direction::Desc => &mut self.desc,
            };
            if let Ok(pos) = Self::search(entries, direction, value, key) {
                entries.remove(pos);
                removed = true;
            }
        }
        removed
    }

    /// Position of `(value, key)` in `direction` order: `Ok` when present,
    /// otherwise the position it would be inserted at.
    pub fn rank(&self, direction: Direction, value: &Value, key: &PrimaryKey) -> Result<usize, usize> {
        Self::search(self.ordered(direction), direction, value, key)
    }

    /// Number of entries strictly before `(value, key)`.
    pub fn lower_bound(&self, direction: Direction, value: &Value, key: &PrimaryKey) -> usize {
        match self.rank(direction, value, key) {
            Ok(pos) | Err(pos) => pos,
        }
    }

    /// Number of entries at or before `(value, key)`.
    pub fn upper_bound(&self, direction: Direction, value: &Value, key: &PrimaryKey) -> usize {
        match self.rank(direction, value, key) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        }
    }

    pub fn get(&self, direction: Direction, position: usize) -> Option<&SortEntry> {
        self.ordered(direction).get(position)
    }

    /// Entries from `start` to the end, in `direction` order.
    pub fn tail(&self, direction: Direction, start: usize) -> Vector<SortEntry> {
        let entries = self.ordered(direction);
        if start >= entries.len() {
            return Vector::new();
        }
        entries.skip(start)
    }

    /// Entries before `end`, in `direction` order; walk with `.iter().rev()`
    /// to move away from `end`.
    pub fn head(&self, direction: Direction, end: usize) -> Vector<SortEntry> {
        let entries = self.ordered(direction);
        entries.take(end.min(entries.len()))
    }

    pub fn iter(&self, direction: Direction) -> im::vector::Iter<'_, SortEntry> {
        self.ordered(direction).iter()
    }
}
