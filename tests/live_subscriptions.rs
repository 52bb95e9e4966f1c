use liveindex::ingest::memory::MemoryChangeSource;
use liveindex::protocol::{DeltaMessage, WireRow, apply_delta};
use liveindex::{
    ChangeEvent, Claims, ColumnConfig, ColumnType, Direction, FilterKind, LiveIndex, LiveIndexConfig,
    PrimaryKey, QuerySpec, ServerMessage, SortKind, TableConfig, TableState, Transaction, Value,
};
use liveindex::row_image;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn logs_config() -> TableConfig {
    TableConfig::new("logs", "id")
        .column(
            ColumnConfig::new("id", ColumnType::Text)
                .searchable()
                .sortable(SortKind::Alphabetical),
        )
        .column(ColumnConfig::new("version", ColumnType::Text).filterable(FilterKind::Categorical))
        .column(ColumnConfig::new("message", ColumnType::Text).searchable())
}

fn jobs_config() -> TableConfig {
    TableConfig::new("jobs", "id")
        .column(ColumnConfig::new("id", ColumnType::Integer).sortable(SortKind::Numeric))
        .column(ColumnConfig::new("queue", ColumnType::Text).filterable(FilterKind::Categorical))
        .column(
            ColumnConfig::new("priority", ColumnType::Integer)
                .sortable(SortKind::Numeric)
                .filterable(FilterKind::NumericRange),
        )
}

async fn next_message(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("connection channel closed")
}

async fn next_delta(rx: &mut mpsc::Receiver<ServerMessage>) -> DeltaMessage {
    match next_message(rx).await {
        ServerMessage::Delta(delta) => delta,
        other => panic!("expected a delta, got {other:?}"),
    }
}

async fn wait_ready(index: &LiveIndex, table: &str, position: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = index.table_status(table).expect("status");
            if status.state == TableState::Ready && status.position.get() >= position {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("table never became ready");
}

#[tokio::test]
async fn version_filter_follows_updates_with_facet_changes() {
    let source = MemoryChangeSource::new();
    source.create_table("logs", "id");
    source
        .commit(
            "logs",
            vec![
                ChangeEvent::insert(row_image! { "id" => "1", "version" => "1.0", "message" => "boot" }),
                ChangeEvent::insert(row_image! { "id" => "2", "version" => "2.0", "message" => "ready" }),
            ],
        )
        .expect("commit");

    let index = LiveIndex::new(LiveIndexConfig::development());
    index.register_table(&logs_config()).expect("register");
    index
        .start_ingestion("logs", Arc::new(source.clone()), None)
        .expect("start");
    wait_ready(&index, "logs", 1).await;

    let (conn, mut rx) = index.connect(Claims::new());
    let spec = QuerySpec::new()
        .filter_eq("version", "2.0")
        .order_by("id", Direction::Asc);
    let session = conn.subscribe(1, "logs", spec, true).expect("subscribe");

    let (mut window, mut facets) = match next_message(&mut rx).await {
        ServerMessage::InitialResult {
            session_id,
            page,
            facets,
            ..
        } => {
            assert_eq!(session_id, session);
            assert_eq!(page.total, Some(1));
            (page.rows, facets.expect("facets requested"))
        }
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].key, PrimaryKey::from("2"));

    source
        .commit(
            "logs",
            vec![ChangeEvent::update(
                row_image! { "id" => "1", "version" => "2.0", "message" => "boot" },
            )],
        )
        .expect("commit");

    let delta = next_delta(&mut rx).await;
    assert_eq!(delta.session_id, session);
    assert_eq!(delta.total, Some(2));
    assert_eq!(delta.inserted.len(), 1);
    assert_eq!(delta.inserted[0].index, 0);
    assert_eq!(delta.inserted[0].row.key, PrimaryKey::from("1"));
    assert!(delta.removed.is_empty());

    let facet_delta = delta.facets.as_ref().expect("facet delta");
    let old = facet_delta
        .change("version", &Value::from("1.0"))
        .expect("1.0 changed");
    assert_eq!((old.from, old.to), (1, 0));
    assert!(old.is_removal());
    let new = facet_delta
        .change("version", &Value::from("2.0"))
        .expect("2.0 changed");
    assert_eq!((new.from, new.to), (1, 2));

    window = apply_delta(&window, &delta).expect("apply");
    facet_delta.apply_to(&mut facets);
    let keys: Vec<&PrimaryKey> = window.iter().map(|r| &r.key).collect();
    assert_eq!(keys, vec![&PrimaryKey::from("1"), &PrimaryKey::from("2")]);
    let (fresh, _) = index.facets("logs", &Claims::new()).expect("facets");
    assert_eq!(facets, fresh);

    index.shutdown().await;
}

#[tokio::test]
async fn unrelated_changes_send_nothing() {
    let index = LiveIndex::new(LiveIndexConfig::default());
    index.register_table(&logs_config()).expect("register");
    let (conn, mut rx) = index.connect(Claims::new());
    conn.subscribe(1, "logs", QuerySpec::new().filter_eq("version", "2.0"), false)
        .expect("subscribe");
    assert!(matches!(next_message(&mut rx).await, ServerMessage::InitialResult { .. }));

    index
        .apply(&Transaction::new(
            "logs",
            1,
            vec![ChangeEvent::insert(row_image! { "id" => "9", "version" => "1.0" })],
        ))
        .expect("apply");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn insert_ahead_of_full_window_evicts_the_last_row() {
    let index = LiveIndex::new(LiveIndexConfig::default());
    index.register_table(&jobs_config()).expect("register");
    index
        .apply(&Transaction::new(
            "jobs",
            1,
            (1..=3i64)
                .map(|id| ChangeEvent::insert(row_image! { "id" => id, "queue" => "a", "priority" => 1i64 }))
                .collect(),
        ))
        .expect("seed");

    let (conn, mut rx) = index.connect(Claims::new());
    let spec = QuerySpec::new().order_by("id", Direction::Asc).limit(2);
    conn.subscribe(7, "jobs", spec, false).expect("subscribe");
    let window = match next_message(&mut rx).await {
        ServerMessage::InitialResult { request_id, page, .. } => {
            assert_eq!(request_id, 7);
            assert_eq!(page.total, Some(3));
            page.rows
        }
        other => panic!("unexpected {other:?}"),
    };

    index
        .apply(&Transaction::new(
            "jobs",
            2,
            vec![ChangeEvent::insert(row_image! { "id" => 0i64, "queue" => "a", "priority" => 1i64 })],
        ))
        .expect("apply");
    let delta = next_delta(&mut rx).await;
    assert_eq!(delta.inserted.len(), 1);
    assert_eq!(delta.inserted[0].index, 0);
    assert_eq!(delta.inserted[0].row.key, PrimaryKey::from(0i64));
    assert_eq!(delta.removed, vec![PrimaryKey::from(2i64)]);
    assert_eq!(delta.total, Some(4));

    let window = apply_delta(&window, &delta).expect("apply");
    let keys: Vec<PrimaryKey> = window.into_iter().map(|r| r.key).collect();
    assert_eq!(keys, vec![PrimaryKey::from(0i64), PrimaryKey::from(1i64)]);
}

#[tokio::test]
async fn updated_subscription_restarts_from_a_fresh_result() {
    let index = LiveIndex::new(LiveIndexConfig::default());
    index.register_table(&jobs_config()).expect("register");
    index
        .apply(&Transaction::new(
            "jobs",
            1,
            vec![
                ChangeEvent::insert(row_image! { "id" => 1i64, "queue" => "a", "priority" => 5i64 }),
                ChangeEvent::insert(row_image! { "id" => 2i64, "queue" => "b", "priority" => 3i64 }),
            ],
        ))
        .expect("seed");
    let (conn, mut rx) = index.connect(Claims::new());
    let session = conn
        .subscribe(1, "jobs", QuerySpec::new().filter_eq("queue", "a"), false)
        .expect("subscribe");
    let _ = next_message(&mut rx).await;

    conn.update_subscription(2, session, QuerySpec::new().filter_eq("queue", "b"))
        .expect("update");
    match next_message(&mut rx).await {
        ServerMessage::InitialResult {
            request_id,
            session_id,
            page,
            ..
        } => {
            assert_eq!((request_id, session_id), (2, session));
            assert_eq!(page.rows.len(), 1);
            assert_eq!(page.rows[0].key, PrimaryKey::from(2i64));
        }
        other => panic!("unexpected {other:?}"),
    }

    let err = conn
        .update_subscription(3, session, QuerySpec::new().order_by("queue", Direction::Asc))
        .expect_err("queue is not sortable");
    assert_eq!(err.code_str(), "configuration_error");

    index
        .apply(&Transaction::new(
            "jobs",
            2,
            vec![ChangeEvent::insert(row_image! { "id" => 3i64, "queue" => "b", "priority" => 1i64 })],
        ))
        .expect("apply");
    let delta = next_delta(&mut rx).await;
    assert_eq!(delta.inserted.len(), 1);
    assert_eq!(delta.inserted[0].row.key, PrimaryKey::from(3i64));

    conn.unsubscribe(4, session).expect("unsubscribe");
    assert!(matches!(
        next_message(&mut rx).await,
        ServerMessage::Unsubscribed { request_id: Some(4), .. }
    ));
    assert_eq!(index.session_count(), 0);
    let err = conn.unsubscribe(5, session).expect_err("already gone");
    assert_eq!(err.code_str(), "session_not_found");
}

#[derive(Debug, Clone)]
enum Op {
    Upsert { id: i64, queue: u8, priority: i64 },
    Delete { id: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0i64..24, 0u8..3, -5i64..5).prop_map(|(id, queue, priority)| Op::Upsert { id, queue, priority }),
        1 => (0i64..24).prop_map(|id| Op::Delete { id }),
    ]
}

fn queue_name(queue: u8) -> &'static str {
    ["a", "b", "c"][queue as usize % 3]
}

fn to_event(op: &Op) -> ChangeEvent {
    match op {
        Op::Upsert { id, queue, priority } => ChangeEvent::update(row_image! {
            "id" => *id,
            "queue" => queue_name(*queue),
            "priority" => *priority,
        }),
        Op::Delete { id } => ChangeEvent::delete(*id),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn client_window_tracks_fresh_queries(
        batches in prop::collection::vec(prop::collection::vec(op_strategy(), 1..6), 1..25),
        offset in 0usize..4,
        limit in 1usize..6,
        desc in any::<bool>(),
        filtered in any::<bool>(),
    ) {
        let index = LiveIndex::new(LiveIndexConfig::default());
        index.register_table(&jobs_config()).expect("register");
        let direction = if desc { Direction::Desc } else { Direction::Asc };
        let mut spec = QuerySpec::new().order_by("priority", direction).offset(offset).limit(limit);
        if filtered {
            spec = spec.filter_in("queue", vec![Value::from("a"), Value::from("b")]);
        }

        let (conn, mut rx) = index.connect(Claims::new());
        conn.subscribe(1, "jobs", spec.clone(), false).expect("subscribe");
        let mut window: Vec<WireRow> = match rx.try_recv() {
            Ok(ServerMessage::InitialResult { page, .. }) => page.rows,
            other => panic!("unexpected {other:?}"),
        };

        for (i, batch) in batches.iter().enumerate() {
            let txn = Transaction::new("jobs", i as u64 + 1, batch.iter().map(to_event).collect());
            index.apply(&txn).expect("apply");
            while let Ok(message) = rx.try_recv() {
                match message {
                    ServerMessage::Delta(delta) => {
                        window = apply_delta(&window, &delta).expect("delta applies");
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            let fresh = index.query("jobs", &spec, &Claims::new()).expect("query");
            let descriptor = index.descriptor("jobs").expect("descriptor");
            let expected: Vec<WireRow> = fresh
                .rows
                .iter()
                .map(|row| WireRow::from_row(&descriptor, row))
                .collect();
            prop_assert_eq!(&window, &expected);
        }
    }
}
