/// Concurrent access tests
///
/// Many tasks racing on the same rows through the retry executor
/// Run with: cargo test --test concurrent_access_tests

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;
use txretry::memory::MemoryPool;
use txretry::{ConnectionConfig, ConnectionSource, DbError, TransactionHandle, Value, execute_tx};

async fn counter_pool(max_connections: usize) -> Arc<MemoryPool> {
    let config = ConnectionConfig::memory("counters").max_connections(max_connections);
    let pool = MemoryPool::open(config).unwrap();

    let mut tx = pool.begin().await.unwrap();
    tx.execute("CREATE TABLE counter (name TEXT NOT NULL, hits INTEGER NOT NULL)", &[])
        .await
        .unwrap();
    tx.execute("INSERT INTO counter VALUES ('saver', 0)", &[])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    Arc::new(pool)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_not_lost() {
    let pool = counter_pool(16).await;
    let cancel = CancellationToken::new();
    let invocations = Arc::new(AtomicU32::new(0));

    let num_tasks = 8;
    let increments_per_task = 10;
    let barrier = Arc::new(Barrier::new(num_tasks));

    let mut handles = vec![];
    for _ in 0..num_tasks {
        let pool = Arc::clone(&pool);
        let cancel = cancel.clone();
        let invocations = Arc::clone(&invocations);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            for _ in 0..increments_per_task {
                execute_tx(&cancel, &*pool, |tx| {
                    let invocations = Arc::clone(&invocations);
                    Box::pin(async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        let current = tx
                            .query("SELECT hits FROM counter WHERE name = $1", &[Value::from("saver")])
                            .await?;
                        let hits = current
                            .get(0, "hits")
                            .and_then(Value::as_i64)
                            .unwrap_or_default();

                        tokio::task::yield_now().await;

                        tx.execute(
                            "UPDATE counter SET hits = $1 WHERE name = $2",
                            &[Value::from(hits + 1), Value::from("saver")],
                        )
                        .await?;
                        Ok::<_, DbError>(())
                    })
                })
                .await
                .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let total = (num_tasks * increments_per_task) as i64;
    let rows = pool.database().table_rows("counter").await.unwrap();
    assert_eq!(rows.get(0, "hits"), Some(&Value::Integer(total)));

    // every conflict costs one extra invocation
    assert!(invocations.load(Ordering::SeqCst) as i64 >= total);
    assert_eq!(pool.stats().active_connections, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_land_exactly_once() {
    let pool = counter_pool(4).await;
    let cancel = CancellationToken::new();

    let mut handles = vec![];
    for task_id in 0..12i64 {
        let pool = Arc::clone(&pool);
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            execute_tx(&cancel, &*pool, |tx| {
                Box::pin(async move {
                    tx.execute(
                        "INSERT INTO counter VALUES ($1, $2)",
                        &[Value::from(format!("task_{}", task_id)), Value::from(task_id)],
                    )
                    .await?;
                    tokio::task::yield_now().await;
                    Ok::<_, DbError>(())
                })
            })
            .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let rows = pool.database().table_rows("counter").await.unwrap();
    assert_eq!(rows.row_count(), 13);

    let mut names: Vec<String> = rows
        .rows
        .iter()
        .filter_map(|row| row[0].as_str().map(str::to_string))
        .filter(|name| name.starts_with("task_"))
        .collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 12);
}
