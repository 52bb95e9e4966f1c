pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod facet;
pub mod ingest;
pub mod protocol;
pub mod query;
pub mod session;
pub mod snapshot;
pub mod status;
pub mod storage;

pub use crate::catalog::TableDescriptor;
pub use crate::catalog::schema::{ColumnConfig, FilterKind, SortKind, TableConfig};
pub use crate::catalog::types::{Claims, ColumnType, PrimaryKey, RowImage, Value};
pub use crate::config::LiveIndexConfig;
pub use crate::error::{ErrorCode, LiveIndexError};
pub use crate::facet::{FacetDelta, FacetSnapshot};
pub use crate::ingest::event::{ChangeEvent, LogPosition, Transaction};
pub use crate::protocol::{ClientRequest, ServerMessage, SessionId};
pub use crate::query::{QueryPage, QuerySpec};
pub use crate::status::{TableState, TableStatus};
pub use crate::storage::sort::Direction;

use crate::checkpoint::CheckpointStore;
use crate::facet::FacetAggregator;
use crate::ingest::{ChangeListener, IngestTarget};
use crate::ingest::reader::{ReaderHandle, spawn_reader};
use crate::ingest::source::ChangeSource;
use crate::protocol::codec::Encoding;
use crate::protocol::{PageResult, RequestId};
use crate::query::executor::execute;
use crate::query::operators::CompiledQuery;
use crate::session::{ConnectionId, SessionManager};
use crate::snapshot::reader::TableReadView;
use crate::status::StatusHandle;
use crate::storage::table::TableStore;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct TableEntry {
    target: IngestTarget,
    reader: Mutex<Option<ReaderHandle>>,
}

impl TableEntry {
    fn view(&self) -> TableReadView {
        TableReadView {
            table: self.target.store.head(),
            status: self.target.status.snapshot(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: LiveIndexConfig,
    tables: DashMap<String, Arc<TableEntry>>,
    sessions: Arc<SessionManager>,
}

/// A set of live-indexed tables plus the sessions subscribed to them.
///
/// Cloning is cheap; clones share the same tables and sessions.
#[derive(Debug, Clone)]
pub struct LiveIndex {
    inner: Arc<Inner>,
}

impl LiveIndex {
    pub fn new(config: LiveIndexConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(config.clone()));
        Self {
            inner: Arc::new(Inner {
                config,
                tables: DashMap::new(),
                sessions,
            }),
        }
    }

    pub fn config(&self) -> &LiveIndexConfig {
        &self.inner.config
    }

    /// Resolves `config` into a descriptor and creates the empty table.
    /// Configuration is fixed from here on.
    pub fn register_table(&self, config: &TableConfig) -> Result<Arc<TableDescriptor>, LiveIndexError> {
        let descriptor = Arc::new(TableDescriptor::resolve(config)?);
        let name = descriptor.name.clone();
        match self.inner.tables.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(LiveIndexError::config(format!("table '{name}' is already registered")));
            }
            Entry::Vacant(slot) => {
                let store = Arc::new(TableStore::new(Arc::clone(&descriptor)));
                let listener: Arc<dyn ChangeListener> = self.inner.sessions.clone();
                let target = IngestTarget::new(store, StatusHandle::new(&name)).with_listener(listener);
                slot.insert(Arc::new(TableEntry {
                    target,
                    reader: Mutex::new(None),
                }));
            }
        }
        info!(
            table = %name,
            columns = descriptor.columns.len(),
            secured = descriptor.security.is_some(),
            fingerprint = descriptor.fingerprint,
            "table registered"
        );
        Ok(descriptor)
    }

    fn table(&self, name: &str) -> Result<Arc<TableEntry>, LiveIndexError> {
        self.inner
            .tables
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LiveIndexError::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn descriptor(&self, table: &str) -> Result<Arc<TableDescriptor>, LiveIndexError> {
        Ok(Arc::clone(self.table(table)?.target.store.descriptor()))
    }

    pub fn table_status(&self, table: &str) -> Result<TableStatus, LiveIndexError> {
        Ok(self.table(table)?.target.status.snapshot())
    }

    /// Applies one transaction directly, for embedders that push changes
    /// themselves instead of running a reader. Returns `None` for a
    /// transaction at or below the table's position.
    pub fn apply(&self, txn: &Transaction) -> Result<Option<LogPosition>, LiveIndexError> {
        self.table(&txn.table)?.target.apply(txn)
    }

    /// Starts the change stream reader for `table`: restore from
    /// `checkpoints` or snapshot `source`, then follow its change stream.
    pub fn start_ingestion(
        &self,
        table: &str,
        source: Arc<dyn ChangeSource>,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
    ) -> Result<(), LiveIndexError> {
        let entry = self.table(table)?;
        let mut reader = entry.reader.lock();
        if reader.as_ref().is_some_and(|r| !r.is_finished()) {
            return Err(LiveIndexError::config(format!(
                "table '{table}' is already ingesting"
            )));
        }
        *reader = Some(spawn_reader(
            entry.target.clone(),
            source,
            checkpoints,
            self.inner.config.clone(),
        ));
        info!(table = %table, "ingestion started");
        Ok(())
    }

    /// Stops the reader of `table`, if one runs. The table keeps serving its
    /// last state.
    pub async fn stop_ingestion(&self, table: &str) -> Result<(), LiveIndexError> {
        let handle = self.table(table)?.reader.lock().take();
        if let Some(handle) = handle {
            self.stop_reader(table, handle).await;
        }
        Ok(())
    }

    async fn stop_reader(&self, table: &str, handle: ReaderHandle) {
        let timeout = self.inner.config.shutdown_timeout;
        let abort = handle.abort_handle();
        if tokio::time::timeout(timeout, handle.shutdown()).await.is_err() {
            warn!(table = %table, timeout_ms = timeout.as_millis() as u64, "reader did not stop in time; aborting");
            abort.abort();
        }
    }

    /// Stops every reader.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ReaderHandle)> = self
            .inner
            .tables
            .iter()
            .filter_map(|e| e.value().reader.lock().take().map(|h| (e.key().clone(), h)))
            .collect();
        for (table, handle) in handles {
            self.stop_reader(&table, handle).await;
        }
        info!("live index shut down");
    }

    /// Answers one page of `spec` as `claims` may see it.
    pub fn query(&self, table: &str, spec: &QuerySpec, claims: &Claims) -> Result<QueryPage, LiveIndexError> {
        let entry = self.table(table)?;
        let view = entry.view();
        self.query_view(&view, spec, claims)
    }

    fn query_view(&self, view: &TableReadView, spec: &QuerySpec, claims: &Claims) -> Result<QueryPage, LiveIndexError> {
        let descriptor = &view.table.descriptor;
        let scope = descriptor.scope_for(claims)?;
        let compiled = CompiledQuery::compile(descriptor, spec, scope, self.inner.config.search)?;
        let page = execute(view, &compiled, spec, self.inner.config.page_limits())?;
        debug!(
            table = %descriptor.name,
            rows = page.rows.len(),
            total = ?page.total,
            position = page.position.get(),
            "query answered"
        );
        Ok(page)
    }

    /// Facet counts visible to `claims`, with the position they reflect.
    pub fn facets(&self, table: &str, claims: &Claims) -> Result<(FacetSnapshot, LogPosition), LiveIndexError> {
        let entry = self.table(table)?;
        let snapshot = entry.target.store.head();
        let scope = snapshot.descriptor.scope_for(claims)?;
        Ok((FacetAggregator::snapshot(&snapshot, scope.as_ref()), snapshot.position))
    }

    /// A page and the facet counts, both from one snapshot.
    pub fn query_with_facets(
        &self,
        table: &str,
        spec: &QuerySpec,
        claims: &Claims,
    ) -> Result<(QueryPage, FacetSnapshot), LiveIndexError> {
        let entry = self.table(table)?;
        let view = entry.view();
        let page = self.query_view(&view, spec, claims)?;
        let scope = view.table.descriptor.scope_for(claims)?;
        Ok((page, FacetAggregator::snapshot(&view.table, scope.as_ref())))
    }

    /// Opens a client connection. Every reply, initial result and delta for
    /// the connection arrives on the returned receiver.
    pub fn connect(&self, claims: Claims) -> (Connection, mpsc::Receiver<ServerMessage>) {
        let (id, rx) = self.inner.sessions.open_connection();
        (
            Connection {
                index: self.clone(),
                id,
                claims,
            },
            rx,
        )
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.session_count()
    }
}

/// One client's view of a [`LiveIndex`]: its claims and the sessions it
/// owns. Dropping the connection closes its sessions.
#[derive(Debug)]
pub struct Connection {
    index: LiveIndex,
    id: ConnectionId,
    claims: Claims,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Serves one request; the answer, or an error message, is sent on the
    /// connection's channel.
    pub fn handle(&self, request: ClientRequest) {
        let request_id = request.request_id();
        let result = match request {
            ClientRequest::Query {
                request_id,
                table,
                spec,
                facets,
            } => self.query(request_id, &table, &spec, facets),
            ClientRequest::Facets { request_id, table } => self
                .index
                .facets(&table, &self.claims)
                .and_then(|(facets, position)| {
                    self.reply(ServerMessage::Facets {
                        request_id,
                        facets,
                        position,
                    })
                }),
            ClientRequest::Subscribe {
                request_id,
                table,
                spec,
                facets,
            } => self.subscribe(request_id, &table, spec, facets).map(|_| ()),
            ClientRequest::UpdateSubscription {
                request_id,
                session_id,
                spec,
            } => self.update_subscription(request_id, session_id, spec),
            ClientRequest::Unsubscribe {
                request_id,
                session_id,
            } => self.unsubscribe(request_id, session_id),
        };
        if let Err(e) = result {
            debug!(connection_id = self.id, request_id, code = e.code_str(), error = %e, "request failed");
            let _ = self.reply(ServerMessage::error(Some(request_id), &e));
        }
    }

    /// Decodes and serves one encoded request. Undecodable payloads are
    /// answered with an error.
    pub fn handle_encoded(&self, encoding: Encoding, payload: &[u8]) {
        match encoding.decode_request(payload) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!(connection_id = self.id, error = %e, "undecodable request");
                let _ = self.reply(ServerMessage::error(None, &e));
            }
        }
    }

    fn reply(&self, message: ServerMessage) -> Result<(), LiveIndexError> {
        self.index.inner.sessions.reply(self.id, message)
    }

    fn query(&self, request_id: RequestId, table: &str, spec: &QuerySpec, facets: bool) -> Result<(), LiveIndexError> {
        let (page, facets) = if facets {
            let (page, facets) = self.index.query_with_facets(table, spec, &self.claims)?;
            (page, Some(facets))
        } else {
            (self.index.query(table, spec, &self.claims)?, None)
        };
        let descriptor = self.index.descriptor(table)?;
        self.reply(ServerMessage::QueryResult {
            request_id,
            page: PageResult::from_page(&descriptor, &page),
            facets,
        })
    }

    pub fn subscribe(
        &self,
        request_id: RequestId,
        table: &str,
        spec: QuerySpec,
        facets: bool,
    ) -> Result<SessionId, LiveIndexError> {
        let entry = self.index.table(table)?;
        let scope = entry.target.store.descriptor().scope_for(&self.claims)?;
        self.index.inner.sessions.subscribe(
            self.id,
            request_id,
            &entry.target.store,
            &entry.target.status,
            spec,
            scope,
            facets,
        )
    }

    pub fn update_subscription(
        &self,
        request_id: RequestId,
        session_id: SessionId,
        spec: QuerySpec,
    ) -> Result<(), LiveIndexError> {
        let session = self
            .index
            .inner
            .sessions
            .session(session_id)
            .ok_or(LiveIndexError::SessionNotFound(session_id))?;
        let entry = self.index.table(&session.table)?;
        self.index.inner.sessions.update_subscription(
            self.id,
            request_id,
            session_id,
            &entry.target.store,
            &entry.target.status,
            spec,
        )
    }

    pub fn unsubscribe(&self, request_id: RequestId, session_id: SessionId) -> Result<(), LiveIndexError> {
        self.index.inner.sessions.unsubscribe(self.id, request_id, session_id)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.index.inner.sessions.close_connection(self.id);
    }
}
