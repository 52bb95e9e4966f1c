pub mod dispatch;
pub mod registry;
pub mod window;

use crate::catalog::SecurityScope;
use crate::catalog::types::PrimaryKey;
use crate::config::LiveIndexConfig;
use crate::error::LiveIndexError;
use crate::facet::{FacetAggregator, FacetDelta};
use crate::ingest::ChangeListener;
use crate::protocol::{DeltaMessage, InsertedRow, PageResult, RequestId, ServerMessage, SessionId, WireRow};
use crate::query::error::QueryError;
use crate::query::executor::{WindowPage, candidate_keys, count_matches, execute, offset_after, resolve_start};
use crate::query::operators::CompiledQuery;
use crate::query::plan::QuerySpec;
use crate::session::dispatch::{DispatchError, Outbox};
use crate::session::registry::PredicateIndex;
use crate::session::window::{WindowBounds, advance, diff};
use crate::snapshot::reader::TableReadView;
use crate::status::StatusHandle;
use crate::storage::table::{AppliedTransaction, TableStore};
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Initial result being computed.
    Subscribing,
    Active,
    Closed,
}

#[derive(Debug)]
struct LiveQuery {
    state: SessionState,
    spec: QuerySpec,
    compiled: CompiledQuery,
    bounds: WindowBounds,
    window: WindowPage,
    /// Table version the window reflects.
    version: u64,
}

/// One subscribed query and the window last delivered for it.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub table: String,
    pub connection: ConnectionId,
    facets: bool,
    scope: Option<SecurityScope>,
    outbox: Outbox,
    live: Mutex<LiveQuery>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.live.lock().state
    }

    pub fn spec(&self) -> QuerySpec {
        self.live.lock().spec.clone()
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    outbox: Outbox,
    sessions: HashSet<SessionId>,
}

/// Validated form of a subscribe or update request.
struct Prepared {
    compiled: CompiledQuery,
    start: crate::query::plan::CursorPosition,
    limit: usize,
}

/// Owns every live session, routes applied transactions to the sessions
/// they can affect and sends the resulting deltas.
#[derive(Debug)]
pub struct SessionManager {
    config: LiveIndexConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    predicates: DashMap<String, PredicateIndex>,
    next_session: AtomicU64,
    next_connection: AtomicU64,
}

impl SessionManager {
    pub fn new(config: LiveIndexConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            connections: DashMap::new(),
            predicates: DashMap::new(),
            next_session: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn open_connection(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = Outbox::new(id, self.config.session_channel_capacity);
        self.connections.insert(
            id,
            ConnectionEntry {
                outbox,
                sessions: HashSet::new(),
            },
        );
        debug!(connection_id = id, "connection opened");
        (id, rx)
    }

    /// Sends a reply outside any session.
    pub fn reply(&self, connection: ConnectionId, message: ServerMessage) -> Result<(), LiveIndexError> {
        let outbox = self
            .connections
            .get(&connection)
            .map(|entry| entry.outbox.clone())
            .ok_or_else(|| LiveIndexError::session(0, format!("connection {connection} is closed")))?;
        outbox.deliver(message).map_err(|e| {
            warn!(connection_id = connection, error = %e, "reply dropped");
            LiveIndexError::session(0, e.to_string())
        })
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn prepare(
        &self,
        table: &TableStore,
        spec: &QuerySpec,
        scope: Option<SecurityScope>,
    ) -> Result<Prepared, LiveIndexError> {
        let descriptor = table.descriptor();
        let compiled = CompiledQuery::compile(descriptor, spec, scope, self.config.search)?;
        let limits = self.config.page_limits();
        let limit = spec.limit.unwrap_or(limits.default_page_size);
        if limit > limits.max_page_size {
            return Err(QueryError::LimitExceeded {
                requested: limit,
                max: limits.max_page_size,
            }
            .into());
        }
        let start = resolve_start(spec, &compiled, descriptor.fingerprint)?;
        Ok(Prepared { compiled, start, limit })
    }

    /// Runs `spec` against the current head and makes it the session's live
    /// query, returning the initial result to send.
    #[allow(clippy::too_many_arguments)]
    fn load(
        &self,
        live: &mut LiveQuery,
        session: &Session,
        request_id: RequestId,
        table: &TableStore,
        status: &StatusHandle,
        spec: QuerySpec,
        prepared: Prepared,
    ) -> Result<ServerMessage, LiveIndexError> {
        let view = TableReadView {
            table: table.head(),
            status: status.snapshot(),
        };
        let snapshot = &view.table;
        let offset = offset_after(snapshot, &prepared.compiled, &prepared.start)?;
        let page = execute(&view, &prepared.compiled, &spec, self.config.page_limits())?;
        let total = match page.total {
            Some(total) => total,
            None => {
                let candidates = candidate_keys(snapshot, &prepared.compiled)?;
                count_matches(snapshot, &prepared.compiled, candidates.as_ref())
            }
        };
        let facets = session
            .facets
            .then(|| FacetAggregator::snapshot(snapshot, session.scope.as_ref()));

        *live = LiveQuery {
            state: SessionState::Active,
            spec,
            compiled: prepared.compiled,
            bounds: WindowBounds {
                offset,
                limit: prepared.limit,
            },
            window: WindowPage {
                keys: page.keys.clone(),
                total,
            },
            version: snapshot.version,
        };
        Ok(ServerMessage::InitialResult {
            request_id,
            session_id: session.id,
            page: PageResult::from_page(&snapshot.descriptor, &page),
            facets,
        })
    }

    /// Creates a session for `spec` and sends its initial result. Invalid
    /// specs are rejected before any session exists.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        request_id: RequestId,
        table: &TableStore,
        status: &StatusHandle,
        spec: QuerySpec,
        scope: Option<SecurityScope>,
        facets: bool,
    ) -> Result<SessionId, LiveIndexError> {
        let outbox = self
            .connections
            .get(&connection)
            .map(|entry| entry.outbox.clone())
            .ok_or_else(|| LiveIndexError::session(0, format!("connection {connection} is closed")))?;
        let prepared = self.prepare(table, &spec, scope.clone())?;
        let table_name = table.descriptor().name.clone();
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session {
            id,
            table: table_name.clone(),
            connection,
            facets,
            scope,
            outbox,
            live: Mutex::new(LiveQuery {
                state: SessionState::Subscribing,
                spec: spec.clone(),
                compiled: prepared.compiled.clone(),
                bounds: WindowBounds {
                    offset: 0,
                    limit: prepared.limit,
                },
                window: WindowPage {
                    keys: Vec::new(),
                    total: 0,
                },
                version: 0,
            }),
        });

        // Registered before the head is read: a transaction published in
        // between either lands in the initial result or waits on the lock
        // and is applied as a delta.
        let mut live = session.live.lock();
        self.sessions.insert(id, Arc::clone(&session));
        self.predicates
            .entry(table_name.clone())
            .or_default()
            .register(id, &prepared.compiled, facets);
        if let Some(mut entry) = self.connections.get_mut(&connection) {
            entry.sessions.insert(id);
        }

        let initial = match self.load(&mut live, &session, request_id, table, status, spec, prepared) {
            Ok(message) => message,
            Err(e) => {
                live.state = SessionState::Closed;
                drop(live);
                self.remove(&session);
                return Err(e);
            }
        };
        if let Err(e) = session.outbox.deliver(initial) {
            live.state = SessionState::Closed;
            drop(live);
            self.remove(&session);
            warn!(session_id = id, error = %e, "initial result dropped; session closed");
            return Err(LiveIndexError::session(id, e.to_string()));
        }
        info!(
            session_id = id,
            connection_id = connection,
            table = %table_name,
            window = live.window.keys.len(),
            total = live.window.total,
            "session active"
        );
        Ok(id)
    }

    /// Replaces a session's query and answers with a fresh initial result.
    /// A rejected spec leaves the session on its previous query.
    pub fn update_subscription(
        &self,
        connection: ConnectionId,
        request_id: RequestId,
        session_id: SessionId,
        table: &TableStore,
        status: &StatusHandle,
        spec: QuerySpec,
    ) -> Result<(), LiveIndexError> {
        let session = self
            .session(session_id)
            .filter(|s| s.connection == connection && s.table == table.descriptor().name)
            .ok_or(LiveIndexError::SessionNotFound(session_id))?;
        let prepared = self.prepare(table, &spec, session.scope.clone())?;

        let mut live = session.live.lock();
        if live.state == SessionState::Closed {
            return Err(LiveIndexError::SessionNotFound(session_id));
        }
        live.state = SessionState::Subscribing;
        if let Some(mut predicates) = self.predicates.get_mut(&session.table) {
            predicates.register(session_id, &prepared.compiled, session.facets);
        }
        let initial = match self.load(&mut live, &session, request_id, table, status, spec, prepared) {
            Ok(message) => message,
            Err(e) => {
                live.state = SessionState::Closed;
                drop(live);
                self.close(&session, "update failed");
                return Err(e);
            }
        };
        if let Err(e) = session.outbox.deliver(initial) {
            live.state = SessionState::Closed;
            drop(live);
            self.close(&session, &e.to_string());
            return Err(LiveIndexError::session(session_id, e.to_string()));
        }
        debug!(session_id, "subscription updated");
        Ok(())
    }

    pub fn unsubscribe(
        &self,
        connection: ConnectionId,
        request_id: RequestId,
        session_id: SessionId,
    ) -> Result<(), LiveIndexError> {
        let session = self
            .session(session_id)
            .filter(|s| s.connection == connection)
            .ok_or(LiveIndexError::SessionNotFound(session_id))?;
        self.close(&session, "unsubscribed");
        let _ = session.outbox.deliver(ServerMessage::Unsubscribed {
            request_id: Some(request_id),
            session_id,
            reason: "unsubscribed".into(),
        });
        Ok(())
    }

    /// Drops a connection and every session it owns.
    pub fn close_connection(&self, connection: ConnectionId) {
        let Some((_, entry)) = self.connections.remove(&connection) else {
            return;
        };
        for id in entry.sessions {
            if let Some(session) = self.session(id) {
                self.close(&session, "connection closed");
            }
        }
        debug!(connection_id = connection, "connection closed");
    }

    fn close(&self, session: &Session, reason: &str) {
        session.live.lock().state = SessionState::Closed;
        if self.remove(session) {
            info!(session_id = session.id, table = %session.table, reason, "session closed");
        }
    }

    fn remove(&self, session: &Session) -> bool {
        let removed = self.sessions.remove(&session.id).is_some();
        if let Some(mut predicates) = self.predicates.get_mut(&session.table) {
            predicates.unregister(session.id);
        }
        if let Some(mut entry) = self.connections.get_mut(&session.connection) {
            entry.sessions.remove(&session.id);
        }
        removed
    }

    /// Brings one session up to `applied.after` and sends its delta. Runs
    /// under the session lock so deltas and initial results never
    /// interleave. Returns the reason when the session has to close.
    fn react(
        &self,
        session: &Session,
        applied: &AppliedTransaction,
        totals_known: bool,
        unscoped_facets: Option<&FacetDelta>,
    ) -> Option<String> {
        let mut live = session.live.lock();
        if live.state != SessionState::Active || live.version >= applied.after.version {
            return None;
        }
        let next = match advance(
            &applied.before,
            &applied.after,
            &live.compiled,
            &applied.changes,
            &live.window,
            live.bounds,
            self.config.max_incremental_changes,
        ) {
            Ok(next) => next,
            Err(e) => {
                live.state = SessionState::Closed;
                let _ = session.outbox.deliver(ServerMessage::error(None, &LiveIndexError::from(e)));
                return Some("window maintenance failed".into());
            }
        };

        let updated_keys: HashSet<_> = applied
            .changes
            .iter()
            .filter(|c| c.before.is_some() && c.after.is_some())
            .map(|c| &c.key)
            .collect();
        let window_diff = diff(&live.window.keys, &next.keys, |k| updated_keys.contains(k));
        let facets = match (session.facets, &session.scope) {
            (false, _) => None,
            (true, None) => unscoped_facets.cloned(),
            (true, Some(scope)) => Some(FacetAggregator::diff(
                &applied.before,
                &applied.after,
                &applied.changes,
                Some(scope),
            )),
        }
        .filter(|d| !d.is_empty());
        let total_changed = totals_known && next.total != live.window.total;
        live.version = applied.after.version;

        if window_diff.is_empty() && !total_changed && facets.is_none() {
            live.window = next;
            return None;
        }

        let after = &applied.after;
        let row = |key: &PrimaryKey| after.row(key).map(|r| WireRow::from_row(&after.descriptor, r));
        let delta = DeltaMessage {
            session_id: session.id,
            position: after.position,
            inserted: window_diff
                .inserted
                .iter()
                .filter_map(|(index, key)| row(key).map(|row| InsertedRow { index: *index, row }))
                .collect(),
            removed: window_diff.removed,
            updated: window_diff.updated.iter().filter_map(row).collect(),
            moved: window_diff.moved,
            total: totals_known.then_some(next.total),
            facets,
        };
        live.window = next;
        match session.outbox.deliver(ServerMessage::Delta(delta)) {
            Ok(()) => None,
            Err(e) => {
                live.state = SessionState::Closed;
                match e {
                    DispatchError::Full => {
                        warn!(session_id = session.id, table = %session.table, "slow consumer; delta dropped")
                    }
                    DispatchError::Closed => {
                        debug!(session_id = session.id, "receiver gone; delta dropped")
                    }
                }
                Some(e.to_string())
            }
        }
    }
}

impl ChangeListener for SessionManager {
    fn on_applied(&self, applied: &AppliedTransaction, status: &StatusHandle) {
        let table = &applied.after.descriptor.name;
        let candidates = match self.predicates.get(table) {
            Some(predicates) => predicates.candidates(&applied.changes),
            None => return,
        };
        if candidates.is_empty() {
            return;
        }
        let sessions: Vec<Arc<Session>> = candidates.iter().filter_map(|id| self.session(*id)).collect();
        let totals_known = status.totals_known();
        // Unscoped sessions all see the same facet change; compute it once.
        let unscoped_facets = sessions
            .iter()
            .any(|s| s.facets && s.scope.is_none())
            .then(|| FacetAggregator::diff(&applied.before, &applied.after, &applied.changes, None));

        let closed: Vec<(Arc<Session>, String)> = if sessions.len() >= self.config.parallel_session_threshold {
            sessions
                .par_iter()
                .filter_map(|s| {
                    self.react(s, applied, totals_known, unscoped_facets.as_ref())
                        .map(|reason| (Arc::clone(s), reason))
                })
                .collect()
        } else {
            sessions
                .iter()
                .filter_map(|s| {
                    self.react(s, applied, totals_known, unscoped_facets.as_ref())
                        .map(|reason| (Arc::clone(s), reason))
                })
                .collect()
        };
        for (session, reason) in closed {
            self.close(&session, &reason);
        }
        debug!(
            table = %table,
            version = applied.after.version,
            sessions = sessions.len(),
            "sessions updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionManager, SessionState};
    use crate::catalog::TableDescriptor;
    use crate::catalog::schema::{ColumnConfig, FilterKind, SortKind, TableConfig};
    use crate::catalog::types::{ColumnType, PrimaryKey};
    use crate::config::LiveIndexConfig;
    use crate::ingest::IngestTarget;
    use crate::ingest::event::{ChangeEvent, Transaction};
    use crate::protocol::{ServerMessage, WireRow, apply_delta};
    use crate::query::plan::QuerySpec;
    use crate::row_image;
    use crate::status::StatusHandle;
    use crate::storage::sort::Direction;
    use crate::storage::table::TableStore;
    use std::sync::Arc;

    fn target(manager: &Arc<SessionManager>) -> IngestTarget {
        let config = TableConfig::new("logs", "id")
            .column(ColumnConfig::new("id", ColumnType::Text).sortable(SortKind::Alphabetical))
            .column(ColumnConfig::new("version", ColumnType::Text).filterable(FilterKind::Categorical));
        let store = TableStore::new(Arc::new(TableDescriptor::resolve(&config).expect("descriptor")));
        IngestTarget::new(Arc::new(store), StatusHandle::new("logs")).with_listener(manager.clone())
    }

    fn put(target: &IngestTarget, position: u64, id: &str, version: &str) {
        target
            .apply(&Transaction::new(
                "logs",
                position,
                vec![ChangeEvent::update(row_image! { "id" => id, "version" => version })],
            ))
            .expect("apply");
    }

    fn keys(rows: &[WireRow]) -> Vec<String> {
        rows.iter()
            .filter_map(|r| r.key.value().as_text().map(str::to_string))
            .collect()
    }

    #[test]
    fn deltas_keep_the_client_window_in_step() {
        let manager = Arc::new(SessionManager::new(LiveIndexConfig::default()));
        let target = target(&manager);
        put(&target, 1, "1", "1.0");
        put(&target, 2, "2", "2.0");

        let (conn, mut rx) = manager.open_connection();
        let spec = QuerySpec::new().order_by("id", Direction::Asc).limit(2);
        let id = manager
            .subscribe(conn, 7, &target.store, &target.status, spec, None, true)
            .expect("subscribe");
        let Ok(ServerMessage::InitialResult { page, facets, .. }) = rx.try_recv() else {
            panic!("expected initial result");
        };
        assert!(facets.is_some());
        let mut rows = page.rows;
        assert_eq!(keys(&rows), vec!["1", "2"]);

        put(&target, 3, "0", "1.0");
        let Ok(ServerMessage::Delta(delta)) = rx.try_recv() else {
            panic!("expected delta");
        };
        assert_eq!(delta.session_id, id);
        assert_eq!(delta.inserted.len(), 1);
        assert_eq!(delta.inserted[0].index, 0);
        assert_eq!(delta.removed, vec![PrimaryKey::from("2")]);
        assert_eq!(delta.total, Some(3));
        rows = apply_delta(&rows, &delta).expect("apply");
        assert_eq!(keys(&rows), vec!["0", "1"]);

        manager.unsubscribe(conn, 8, id).expect("unsubscribe");
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Unsubscribed { .. })));
        put(&target, 4, "00", "1.0");
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn facet_sessions_share_one_facet_change() {
        let manager = Arc::new(SessionManager::new(LiveIndexConfig::default()));
        let target = target(&manager);
        put(&target, 1, "1", "1.0");

        let (conn, mut rx) = manager.open_connection();
        for (request_id, facets) in [(1, true), (2, true), (3, false)] {
            manager
                .subscribe(conn, request_id, &target.store, &target.status, QuerySpec::new(), None, facets)
                .expect("subscribe");
            assert!(matches!(rx.try_recv(), Ok(ServerMessage::InitialResult { .. })));
        }

        put(&target, 2, "2", "2.0");
        let mut facet_deltas = Vec::new();
        while let Ok(ServerMessage::Delta(delta)) = rx.try_recv() {
            facet_deltas.push(delta.facets);
        }
        assert_eq!(facet_deltas.len(), 3);
        assert_eq!(facet_deltas.iter().filter(|f| f.is_none()).count(), 1);
        let shared: Vec<_> = facet_deltas.into_iter().flatten().collect();
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0], shared[1]);
        let change = shared[0]
            .change("version", &crate::catalog::types::Value::from("2.0"))
            .expect("2.0 bucket");
        assert_eq!((change.from, change.to), (0, 1));
    }

    #[test]
    fn closed_connections_report_session_errors() {
        let manager = Arc::new(SessionManager::new(LiveIndexConfig::default()));
        let target = target(&manager);
        let (conn, rx) = manager.open_connection();
        manager.close_connection(conn);
        drop(rx);

        let err = manager
            .subscribe(conn, 1, &target.store, &target.status, QuerySpec::new(), None, false)
            .expect_err("connection is gone");
        assert_eq!(err.code_str(), "session_error");
        assert!(err.to_string().contains(&format!("connection {conn} is closed")));
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn slow_consumers_are_closed_without_blocking_ingestion() {
        let config = LiveIndexConfig {
            session_channel_capacity: 1,
            ..LiveIndexConfig::default()
        };
        let manager = Arc::new(SessionManager::new(config));
        let target = target(&manager);
        let (conn, mut rx) = manager.open_connection();
        let id = manager
            .subscribe(conn, 1, &target.store, &target.status, QuerySpec::new(), None, false)
            .expect("subscribe");
        let session = manager.session(id).expect("session");
        assert_eq!(session.state(), SessionState::Active);

        put(&target, 1, "a", "1.0");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(manager.session(id).is_none());
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::InitialResult { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rejected_specs_create_no_session() {
        let manager = Arc::new(SessionManager::new(LiveIndexConfig::default()));
        let target = target(&manager);
        let (conn, _rx) = manager.open_connection();
        let bad = QuerySpec::new().filter_eq("missing", "x");
        assert!(
            manager
                .subscribe(conn, 1, &target.store, &target.status, bad.clone(), None, false)
                .is_err()
        );
        assert_eq!(manager.session_count(), 0);

        let id = manager
            .subscribe(conn, 2, &target.store, &target.status, QuerySpec::new(), None, false)
            .expect("subscribe");
        assert!(
            manager
                .update_subscription(conn, 3, id, &target.store, &target.status, bad)
                .is_err()
        );
        let session = manager.session(id).expect("still open");
        assert_eq!(session.spec(), QuerySpec::new());
        assert!(manager.unsubscribe(conn + 1, 4, id).is_err());

        manager.close_connection(conn);
        assert_eq!(manager.session_count(), 0);
    }
}
