use crate::error::LiveIndexError;
use crate::ingest::IngestTarget;
use crate::ingest::event::{LogPosition, Transaction};
use crate::ingest::source::{ChangeSource, TransactionStream};
use tokio::sync::watch;
use tracing::{debug, info};

pub enum BootstrapOutcome {
    /// The table is loaded and caught up; `stream` continues after
    /// `position`.
    Completed {
        position: LogPosition,
        stream: TransactionStream,
    },
    Interrupted,
}

/// Builds a table from scratch: point-in-time snapshot loaded in batches
/// while the change stream is buffered, then the buffer replayed in order.
///
/// The table is emptied first, so a retried bootstrap never mixes rows from
/// two snapshots. Reads during the load see the rows loaded so far.
pub async fn bootstrap(
    target: &IngestTarget,
    source: &dyn ChangeSource,
    batch_size: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<BootstrapOutcome, LiveIndexError> {
    let table = target.table().to_string();
    target.reset();

    let snapshot = source
        .snapshot(&table, batch_size)
        .await
        .map_err(|e| e.into_error(&table))?;
    let snapshot_position = snapshot.position;
    target.status.begin_indexing(snapshot.total_rows);
    info!(
        table = %table,
        position = snapshot_position.get(),
        total_rows = ?snapshot.total_rows,
        "snapshot started"
    );

    let mut stream = source
        .subscribe(&table, snapshot_position)
        .await
        .map_err(|e| e.into_error(&table))?;
    let mut batches = snapshot.batches;
    let mut buffered: Vec<Transaction> = Vec::new();
    let mut loaded = 0usize;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(table = %table, loaded, "snapshot interrupted by shutdown");
                    return Ok(BootstrapOutcome::Interrupted);
                }
            }
            batch = batches.recv() => match batch {
                None => break,
                Some(Err(e)) => return Err(e.into_error(&table)),
                Some(Ok(images)) => {
                    loaded += target.load_images(&images)?;
                    debug!(table = %table, loaded, "snapshot batch loaded");
                }
            },
            txn = stream.recv() => match txn {
                None => {
                    return Err(LiveIndexError::Source {
                        table: table.clone(),
                        message: "change stream closed during snapshot".into(),
                    });
                }
                Some(Err(e)) => return Err(e.into_error(&table)),
                Some(Ok(txn)) => {
                    if txn.position > snapshot_position {
                        buffered.push(txn);
                    }
                }
            },
        }
    }

    target.advance_to(snapshot_position);
    let replayed = buffered.len();
    let mut position = snapshot_position;
    for txn in &buffered {
        if let Some(applied) = target.apply(txn)? {
            position = applied;
        }
    }
    target.status.mark_ready(target.store.position());
    info!(
        table = %table,
        rows = loaded,
        replayed,
        position = position.get(),
        "snapshot complete"
    );
    Ok(BootstrapOutcome::Completed { position, stream })
}

#[cfg(test)]
mod tests {
    use super::{BootstrapOutcome, bootstrap};
    use crate::catalog::TableDescriptor;
    use crate::catalog::schema::{ColumnConfig, TableConfig};
    use crate::catalog::types::{ColumnType, PrimaryKey};
    use crate::ingest::IngestTarget;
    use crate::ingest::event::{ChangeEvent, LogPosition};
    use crate::ingest::memory::MemoryChangeSource;
    use crate::row_image;
    use crate::status::{StatusHandle, TableState};
    use crate::storage::table::TableStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    fn target() -> IngestTarget {
        let desc = TableDescriptor::resolve(
            &TableConfig::new("logs", "id")
                .column(ColumnConfig::new("id", ColumnType::Integer))
                .column(ColumnConfig::new("message", ColumnType::Text)),
        )
        .expect("descriptor");
        IngestTarget::new(Arc::new(TableStore::new(Arc::new(desc))), StatusHandle::new("logs"))
    }

    #[tokio::test]
    async fn concurrent_commits_are_replayed_after_load() {
        let source = MemoryChangeSource::new();
        source.create_table("logs", "id");
        for i in 0..50i64 {
            source
                .commit("logs", vec![ChangeEvent::insert(row_image! { "id" => i, "message" => "old" })])
                .expect("commit");
        }
        source.set_batch_delay(Some(Duration::from_millis(2)));

        let target = target();
        let (_tx, mut shutdown) = watch::channel(false);
        let committer = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                source
                    .commit("logs", vec![ChangeEvent::delete(0i64)])
                    .expect("commit");
                source
                    .commit(
                        "logs",
                        vec![ChangeEvent::update(row_image! { "id" => 1i64, "message" => "new" })],
                    )
                    .expect("commit");
            })
        };

        let outcome = bootstrap(&target, &source, 10, &mut shutdown)
            .await
            .expect("bootstrap");
        committer.await.expect("committer");
        let BootstrapOutcome::Completed { mut stream, position } = outcome else {
            panic!("interrupted");
        };
        // Commits that landed after the load finished arrive on the stream.
        while target.store.position() < source.position() {
            let txn = stream.recv().await.expect("open").expect("txn");
            target.apply(&txn).expect("apply");
        }
        assert!(position >= LogPosition(50));

        let head = target.store.head();
        assert_eq!(head.len(), 49);
        assert!(head.row(&PrimaryKey::from(0i64)).is_none());
        let one = head.row(&PrimaryKey::from(1i64)).expect("row");
        assert_eq!(one.get(1).as_text(), Some("new"));
        assert_eq!(target.status.state(), TableState::Ready);
        assert_eq!(target.status.snapshot().processed_rows, 50);
    }

    #[tokio::test]
    async fn failed_snapshot_leaves_error_and_retry_starts_clean() {
        let source = MemoryChangeSource::new();
        source.create_table("logs", "id");
        for i in 0..30i64 {
            source
                .commit("logs", vec![ChangeEvent::insert(row_image! { "id" => i })])
                .expect("commit");
        }
        let target = target();
        let (_tx, mut shutdown) = watch::channel(false);

        source.fail_next_snapshot_after(2);
        assert!(bootstrap(&target, &source, 10, &mut shutdown).await.is_err());
        assert_eq!(target.store.head().len(), 20);

        let outcome = bootstrap(&target, &source, 10, &mut shutdown)
            .await
            .expect("retry");
        assert!(matches!(outcome, BootstrapOutcome::Completed { .. }));
        assert_eq!(target.store.head().len(), 30);
        assert_eq!(target.status.snapshot().processed_rows, 30);
    }
}
