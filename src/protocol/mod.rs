pub mod codec;
pub mod frame;

use crate::catalog::TableDescriptor;
use crate::catalog::types::{PrimaryKey, Row, RowImage};
use crate::error::LiveIndexError;
use crate::facet::{FacetDelta, FacetSnapshot};
use crate::ingest::event::LogPosition;
use crate::query::executor::QueryPage;
use crate::query::plan::QuerySpec;
use crate::status::TableState;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub type RequestId = u64;
pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Query {
        request_id: RequestId,
        table: String,
        spec: QuerySpec,
        /// Also return facet counts taken from the same snapshot.
        #[serde(default)]
        facets: bool,
    },
    Facets {
        request_id: RequestId,
        table: String,
    },
    Subscribe {
        request_id: RequestId,
        table: String,
        spec: QuerySpec,
        /// Also stream facet counts for the table.
        #[serde(default)]
        facets: bool,
    },
    UpdateSubscription {
        request_id: RequestId,
        session_id: SessionId,
        spec: QuerySpec,
    },
    Unsubscribe {
        request_id: RequestId,
        session_id: SessionId,
    },
}

impl ClientRequest {
    pub fn request_id(&self) -> RequestId {
        match self {
            ClientRequest::Query { request_id, .. }
            | ClientRequest::Facets { request_id, .. }
            | ClientRequest::Subscribe { request_id, .. }
            | ClientRequest::UpdateSubscription { request_id, .. }
            | ClientRequest::Unsubscribe { request_id, .. } => *request_id,
        }
    }
}

/// A row on the wire: its key plus column values by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRow {
    pub key: PrimaryKey,
    pub values: RowImage,
}

impl WireRow {
    pub fn from_row(descriptor: &TableDescriptor, row: &Row) -> Self {
        Self {
            key: descriptor.primary_key_of(row),
            values: descriptor.row_to_image(row),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub rows: Vec<WireRow>,
    pub total: Option<u64>,
    pub next_cursor: Option<String>,
    pub position: LogPosition,
    pub state: TableState,
    pub stale: bool,
}

impl PageResult {
    pub fn from_page(descriptor: &TableDescriptor, page: &QueryPage) -> Self {
        Self {
            rows: page
                .rows
                .iter()
                .map(|row| WireRow::from_row(descriptor, row))
                .collect(),
            total: page.total,
            next_cursor: page.next_cursor.clone(),
            position: page.position,
            state: page.state,
            stale: page.stale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertedRow {
    pub index: usize,
    pub row: WireRow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedRow {
    pub key: PrimaryKey,
    pub from: usize,
    pub to: usize,
}

/// Changes to a live window since the previous message on the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaMessage {
    pub session_id: SessionId,
    pub position: LogPosition,
    #[serde(default)]
    pub inserted: Vec<InsertedRow>,
    #[serde(default)]
    pub removed: Vec<PrimaryKey>,
    #[serde(default)]
    pub updated: Vec<WireRow>,
    #[serde(default)]
    pub moved: Vec<MovedRow>,
    pub total: Option<u64>,
    #[serde(default)]
    pub facets: Option<FacetDelta>,
}

impl DeltaMessage {
    pub fn window_changed(&self) -> bool {
        !(self.inserted.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.moved.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    QueryResult {
        request_id: RequestId,
        page: PageResult,
        #[serde(default)]
        facets: Option<FacetSnapshot>,
    },
    Facets {
        request_id: RequestId,
        facets: FacetSnapshot,
        position: LogPosition,
    },
    InitialResult {
        request_id: RequestId,
        session_id: SessionId,
        page: PageResult,
        #[serde(default)]
        facets: Option<FacetSnapshot>,
    },
    Delta(DeltaMessage),
    Unsubscribed {
        request_id: Option<RequestId>,
        session_id: SessionId,
        reason: String,
    },
    Error {
        request_id: Option<RequestId>,
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(request_id: Option<RequestId>, err: &LiveIndexError) -> Self {
        ServerMessage::Error {
            request_id,
            code: err.code_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// Applies a delta to the window it was computed against.
///
/// Inserted rows and moved rows take their new indexes; every other
/// surviving row keeps its relative order and fills the remaining slots.
pub fn apply_delta(window: &[WireRow], delta: &DeltaMessage) -> Result<Vec<WireRow>, LiveIndexError> {
    let removed: HashSet<&PrimaryKey> = delta.removed.iter().collect();
    let moved: HashMap<&PrimaryKey, &MovedRow> = delta.moved.iter().map(|m| (&m.key, m)).collect();
    let survivors = window.iter().filter(|r| !removed.contains(&r.key)).count();
    let len = survivors + delta.inserted.len();
    let mut slots: Vec<Option<WireRow>> = vec![None; len];

    let mut place = |index: usize, row: WireRow| -> Result<(), LiveIndexError> {
        match slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(row);
                Ok(())
            }
            _ => Err(LiveIndexError::Decode(format!(
                "delta places row {} at invalid index {index}",
                row.key
            ))),
        }
    };
    for inserted in &delta.inserted {
        place(inserted.index, inserted.row.clone())?;
    }
    for row in window {
        if let Some(m) = moved.get(&row.key) {
            place(m.to, row.clone())?;
        }
    }

    let mut rest = window
        .iter()
        .filter(|r| !removed.contains(&r.key) && !moved.contains_key(&r.key));
    for slot in slots.iter_mut().filter(|s| s.is_none()) {
        *slot = rest.next().cloned();
    }

    let updated: HashMap<&PrimaryKey, &WireRow> = delta.updated.iter().map(|r| (&r.key, r)).collect();
    slots
        .into_iter()
        .map(|slot| {
            let row = slot.ok_or_else(|| LiveIndexError::Decode("delta leaves a gap in the window".into()))?;
            Ok(match updated.get(&row.key) {
                Some(newer) => (*newer).clone(),
                None => row,
            })
        })
        .collect()
}
