use crate::catalog::types::Value;
use crate::protocol::SessionId;
use crate::query::operators::CompiledQuery;
use crate::storage::table::RowChange;
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone)]
struct Registration {
    anchor: Option<(usize, SmallVec<[Value; 4]>)>,
    facets: bool,
}

/// Sessions of one table indexed by the equality constraint they filter on.
///
/// A session whose query pins a column to a set of values can only be
/// affected by rows that carried one of those values before or after a
/// change, so a transaction is routed to the sessions registered under the
/// old and new values of its rows. Sessions without such a constraint are
/// evaluated for every transaction.
#[derive(Debug, Default)]
pub struct PredicateIndex {
    anchored: HashMap<usize, HashMap<Value, HashSet<SessionId>>>,
    unanchored: HashSet<SessionId>,
    facets: HashSet<SessionId>,
    registrations: HashMap<SessionId, Registration>,
}

impl PredicateIndex {
    pub fn register(&mut self, session: SessionId, compiled: &CompiledQuery, facets: bool) {
        self.unregister(session);
        let anchor = compiled.anchor();
        match &anchor {
            Some((column, values)) => {
                let by_value = self.anchored.entry(*column).or_default();
                for value in values {
                    by_value.entry(value.clone()).or_default().insert(session);
                }
            }
            None => {
                self.unanchored.insert(session);
            }
        }
        if facets {
            self.facets.insert(session);
        }
        self.registrations.insert(session, Registration { anchor, facets });
    }

    pub fn unregister(&mut self, session: SessionId) -> bool {
        let Some(registration) = self.registrations.remove(&session) else {
            return false;
        };
        match registration.anchor {
            Some((column, values)) => {
                if let Some(by_value) = self.anchored.get_mut(&column) {
                    for value in &values {
                        if let Some(sessions) = by_value.get_mut(value) {
                            sessions.remove(&session);
                            if sessions.is_empty() {
                                by_value.remove(value);
                            }
                        }
                    }
                    if by_value.is_empty() {
                        self.anchored.remove(&column);
                    }
                }
            }
            None => {
                self.unanchored.remove(&session);
            }
        }
        if registration.facets {
            self.facets.remove(&session);
        }
        true
    }

    /// Sessions whose result or facets the changes could affect, ascending.
    pub fn candidates(&self, changes: &[RowChange]) -> Vec<SessionId> {
        if changes.is_empty() {
            return Vec::new();
        }
        let mut out: BTreeSet<SessionId> = self.unanchored.iter().copied().collect();
        out.extend(self.facets.iter().copied());
        for (column, by_value) in &self.anchored {
            for change in changes {
                for row in change.before.iter().chain(change.after.iter()) {
                    if let Some(sessions) = by_value.get(row.get(*column)) {
                        out.extend(sessions.iter().copied());
                    }
                }
            }
        }
        out.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
