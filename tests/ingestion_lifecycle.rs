use liveindex::checkpoint::{CheckpointStore, FileCheckpointStore};
use liveindex::checkpoint::loader::list_checkpoints;
use liveindex::ingest::memory::MemoryChangeSource;
use liveindex::ingest::retry::RetryConfig;
use liveindex::row_image;
use liveindex::{
    ChangeEvent, Claims, ColumnConfig, ColumnType, Direction, FilterKind, LiveIndex, LiveIndexConfig,
    LogPosition, QuerySpec, ServerMessage, SortKind, TableConfig, TableState, TableStatus, Transaction,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn events_config() -> TableConfig {
    TableConfig::new("events", "id")
        .column(ColumnConfig::new("id", ColumnType::Integer).sortable(SortKind::Numeric))
        .column(ColumnConfig::new("kind", ColumnType::Text).filterable(FilterKind::Categorical))
        .column(ColumnConfig::new("body", ColumnType::Text).searchable())
}

fn kind_of(id: i64) -> &'static str {
    match id % 3 {
        0 => "click",
        1 => "view",
        _ => "purchase",
    }
}

fn seed(source: &MemoryChangeSource, ids: std::ops::Range<i64>) {
    let events = ids
        .map(|id| {
            ChangeEvent::insert(row_image! {
                "id" => id,
                "kind" => kind_of(id),
                "body" => format!("event number {id}"),
            })
        })
        .collect();
    source.commit("events", events).expect("commit");
}

fn slow_retry_config() -> LiveIndexConfig {
    LiveIndexConfig {
        retry: RetryConfig::builder()
            .retry_delay(Duration::from_millis(250))
            .max_delay(Duration::from_millis(250))
            .jitter(0.0)
            .build(),
        ..LiveIndexConfig::development()
    }
}

async fn wait_for(index: &LiveIndex, table: &str, done: impl Fn(&TableStatus) -> bool) -> TableStatus {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let status = index.table_status(table).expect("status");
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("timed out waiting for table status")
}

async fn wait_ready(index: &LiveIndex, table: &str, position: LogPosition) -> TableStatus {
    wait_for(index, table, |s| s.state == TableState::Ready && s.position >= position).await
}

fn all_ids(index: &LiveIndex) -> Vec<i64> {
    let mut ids = Vec::new();
    let mut spec = Some(QuerySpec::new().order_by("id", Direction::Asc).limit(1_000));
    while let Some(current) = spec.take() {
        let page = index.query("events", &current, &Claims::new()).expect("query");
        ids.extend(page.keys.iter().filter_map(|k| match k.value() {
            liveindex::Value::Integer(id) => Some(*id),
            _ => None,
        }));
        spec = page.next_cursor.map(|cursor| {
            QuerySpec::new()
                .order_by("id", Direction::Asc)
                .limit(1_000)
                .cursor(cursor)
        });
    }
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_snapshot_reloads_to_the_same_state() {
    let _ = tracing_subscriber::fmt().with_env_filter("liveindex=debug").try_init();
    let source = MemoryChangeSource::new();
    source.create_table("events", "id");
    seed(&source, 0..10_000);
    source.fail_next_snapshot_after(40);

    let index = LiveIndex::new(slow_retry_config());
    index.register_table(&events_config()).expect("register");
    index
        .start_ingestion("events", Arc::new(source.clone()), None)
        .expect("start");

    let stalled = wait_for(&index, "events", |s| s.state == TableState::Stalled).await;
    assert_eq!(stalled.retry_attempt, 1);
    assert!(stalled.last_error.as_deref().is_some_and(|e| e.contains("injected failure")));

    let ready = wait_ready(&index, "events", source.position()).await;
    assert_eq!(ready.last_error, None);
    assert_eq!(ready.processed_rows, 10_000);
    assert_eq!(ready.total_rows, Some(10_000));

    let page = index
        .query("events", &QuerySpec::new().filter_eq("kind", "click"), &Claims::new())
        .expect("query");
    assert_eq!(page.total, Some(3_334));
    assert_eq!(all_ids(&index), (0..10_000).collect::<Vec<_>>());

    index.shutdown().await;
}

#[tokio::test]
async fn totals_are_withheld_until_the_snapshot_completes() {
    let source = MemoryChangeSource::new();
    source.create_table("events", "id");
    seed(&source, 0..500);
    source.set_batch_delay(Some(Duration::from_millis(20)));

    let index = LiveIndex::new(LiveIndexConfig::development());
    index.register_table(&events_config()).expect("register");
    index
        .start_ingestion("events", Arc::new(source.clone()), None)
        .expect("start");

    let indexing = wait_for(&index, "events", |s| s.state == TableState::Indexing && s.processed_rows > 0).await;
    assert_eq!(indexing.total_rows, Some(500));
    let page = index.query("events", &QuerySpec::new(), &Claims::new()).expect("query");
    assert_eq!(page.state, TableState::Indexing);
    assert_eq!(page.total, None);

    source.set_batch_delay(None);
    wait_ready(&index, "events", source.position()).await;
    let page = index.query("events", &QuerySpec::new(), &Claims::new()).expect("query");
    assert_eq!(page.total, Some(500));
    index.shutdown().await;
}

#[tokio::test]
async fn stalled_partial_snapshot_keeps_totals_withheld() {
    let source = MemoryChangeSource::new();
    source.create_table("events", "id");
    seed(&source, 0..1_000);
    source.fail_next_snapshot_after(3);

    let config = LiveIndexConfig {
        snapshot_batch_size: 100,
        retry: RetryConfig::builder()
            .retry_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(5))
            .jitter(0.0)
            .build(),
        ..LiveIndexConfig::development()
    };
    let index = LiveIndex::new(config);
    index.register_table(&events_config()).expect("register");
    index
        .start_ingestion("events", Arc::new(source.clone()), None)
        .expect("start");

    let stalled = wait_for(&index, "events", |s| s.state == TableState::Stalled).await;
    assert!(!stalled.snapshot_complete);
    let page = index.query("events", &QuerySpec::new(), &Claims::new()).expect("query");
    assert_eq!(page.state, TableState::Stalled);
    assert!(page.stale);
    assert_eq!(page.total, None);

    let (conn, mut rx) = index.connect(Claims::new());
    conn.subscribe(1, "events", QuerySpec::new().order_by("id", Direction::Asc), false)
        .expect("subscribe");
    match rx.try_recv() {
        Ok(ServerMessage::InitialResult { page, .. }) => assert_eq!(page.total, None),
        other => panic!("unexpected {other:?}"),
    }
    index.shutdown().await;
}

#[tokio::test]
async fn disconnects_resume_without_a_new_snapshot() {
    let source = MemoryChangeSource::new();
    source.create_table("events", "id");
    seed(&source, 0..20);

    let index = LiveIndex::new(LiveIndexConfig::development());
    index.register_table(&events_config()).expect("register");
    index
        .start_ingestion("events", Arc::new(source.clone()), None)
        .expect("start");
    wait_ready(&index, "events", source.position()).await;

    source.fail_next_subscribes(2);
    source.disconnect_subscribers();
    seed(&source, 20..25);
    let ready = wait_ready(&index, "events", source.position()).await;
    assert_eq!(ready.processed_rows, 20);
    assert_eq!(all_ids(&index), (0..25).collect::<Vec<_>>());

    let err = index
        .start_ingestion("events", Arc::new(source.clone()), None)
        .expect_err("already running");
    assert_eq!(err.code_str(), "configuration_error");
    index.stop_ingestion("events").await.expect("stop");
}

#[tokio::test]
async fn regressing_stream_forces_a_fresh_snapshot() {
    let _ = tracing_subscriber::fmt().with_env_filter("liveindex=debug").try_init();
    let source = MemoryChangeSource::new();
    source.create_table("events", "id");
    seed(&source, 0..2);

    let index = LiveIndex::new(slow_retry_config());
    index.register_table(&events_config()).expect("register");
    index
        .start_ingestion("events", Arc::new(source.clone()), None)
        .expect("start");
    wait_ready(&index, "events", source.position()).await;
    seed(&source, 2..3);
    let ready = wait_ready(&index, "events", source.position()).await;
    assert_eq!(ready.processed_rows, 2);

    source
        .inject(Transaction::new("events", 1, vec![ChangeEvent::delete(0i64)]))
        .expect("inject");
    let stalled = wait_for(&index, "events", |s| s.state == TableState::Stalled).await;
    assert!(
        stalled
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("consistency violation"))
    );

    let ready = wait_ready(&index, "events", source.position()).await;
    assert_eq!(ready.processed_rows, 3);
    assert_eq!(all_ids(&index), vec![0, 1, 2]);
    index.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_from_the_latest_checkpoint() {
    let dir = tempdir().expect("temp");
    let source = MemoryChangeSource::new();
    source.create_table("events", "id");
    seed(&source, 0..50);
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));

    let first = LiveIndex::new(LiveIndexConfig::development());
    first.register_table(&events_config()).expect("register");
    first
        .start_ingestion("events", Arc::new(source.clone()), Some(store.clone()))
        .expect("start");
    wait_ready(&first, "events", source.position()).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.acknowledged("events").is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("checkpoint acknowledged");
    first.shutdown().await;
    assert!(!list_checkpoints(dir.path(), "events").expect("list").is_empty());

    seed(&source, 50..60);
    source.fail_next_snapshot_after(0);

    let second = LiveIndex::new(LiveIndexConfig::development());
    second.register_table(&events_config()).expect("register");
    second
        .start_ingestion("events", Arc::new(source.clone()), Some(store))
        .expect("start");
    let ready = wait_ready(&second, "events", source.position()).await;
    assert_eq!(ready.processed_rows, 0);
    assert_eq!(all_ids(&second), (0..60).collect::<Vec<_>>());
    second.shutdown().await;
}

#[tokio::test]
async fn checkpoints_from_another_configuration_are_ignored() {
    let dir = tempdir().expect("temp");
    let source = MemoryChangeSource::new();
    source.create_table("events", "id");
    seed(&source, 0..10);
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));

    let first = LiveIndex::new(LiveIndexConfig::development());
    first.register_table(&events_config()).expect("register");
    first
        .start_ingestion("events", Arc::new(source.clone()), Some(store.clone()))
        .expect("start");
    wait_ready(&first, "events", source.position()).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.acknowledged("events").is_none() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("checkpoint acknowledged");
    first.shutdown().await;

    let reconfigured = events_config().column(ColumnConfig::new("extra", ColumnType::Boolean));
    let second = LiveIndex::new(LiveIndexConfig::development());
    second.register_table(&reconfigured).expect("register");
    second
        .start_ingestion("events", Arc::new(source.clone()), Some(store))
        .expect("start");
    let ready = wait_ready(&second, "events", source.position()).await;
    assert_eq!(ready.processed_rows, 10);
    second.shutdown().await;
}
