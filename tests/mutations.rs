// Integration tests for mutations driven through observers and the client

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use color_eyre::Result;
use parking_lot::Mutex;
use tears_query::mutation::{MutateOptions, MutationObserver, MutationOptions, MutationStatus};
use tears_query::query::QueryOptions;
use tears_query::query::observer::QueryObserver;
use tears_query::{MutationFilters, QueryClient, QueryError, QueryFilters, RefetchType};

type Log = Arc<Mutex<Vec<String>>>;

// Helper: mutation that records when it starts and finishes
fn logged(log: &Log, delay: Duration) -> MutationOptions<u32, u32> {
    let log = log.clone();
    MutationOptions::new(move |n: Arc<u32>, _ctx| {
        let log = log.clone();
        async move {
            log.lock().push(format!("start-{n}"));
            tokio::time::sleep(delay).await;
            log.lock().push(format!("finish-{n}"));
            Ok(*n)
        }
    })
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

#[tokio::test(start_paused = true)]
async fn test_scoped_mutations_run_one_at_a_time() -> Result<()> {
    let client = QueryClient::new();
    let log = Log::default();
    let first = MutationObserver::new(&client, logged(&log, Duration::from_millis(30)).scope("x"));
    let second = MutationObserver::new(&client, logged(&log, Duration::from_millis(10)).scope("x"));

    first.mutate(1, MutateOptions::new());
    tokio::task::yield_now().await;
    second.mutate(2, MutateOptions::new());
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(client.is_mutating(&MutationFilters::new()), 2);
    assert!(second.get_current_result().is_paused);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(entries(&log), ["start-1", "finish-1", "start-2", "finish-2"]);
    assert_eq!(client.is_mutating(&MutationFilters::new()), 0);
    assert_eq!(second.get_current_result().status, MutationStatus::Success);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unscoped_mutations_overlap() -> Result<()> {
    let client = QueryClient::new();
    let log = Log::default();
    let first = MutationObserver::new(&client, logged(&log, Duration::from_millis(30)));
    let second = MutationObserver::new(&client, logged(&log, Duration::from_millis(40)));

    let (a, b) = tokio::join!(
        first.mutate_async(1, MutateOptions::new()),
        second.mutate_async(2, MutateOptions::new()),
    );

    assert_eq!((*a?, *b?), (1, 2));
    assert_eq!(entries(&log), ["start-1", "start-2", "finish-1", "finish-2"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_successful_mutation_invalidates_related_queries() -> Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let todos = QueryObserver::new(
        &client,
        QueryOptions::new("todos", {
            let calls = calls.clone();
            move |_ctx| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n) }
            }
        })
        .stale_time(Duration::from_secs(60)),
    );
    let _subscription = todos.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let weak = client.downgrade();
    let add_todo = MutationObserver::new(
        &client,
        MutationOptions::<String, String>::new(|title: Arc<String>, _ctx| async move {
            Ok(format!("created {title}"))
        })
        .on_success(move |_, _, _| {
            let weak = weak.clone();
            async move {
                if let Some(client) = weak.upgrade() {
                    client
                        .invalidate_queries(&QueryFilters::key("todos"), RefetchType::Active)
                        .await?;
                }
                Ok::<(), QueryError>(())
            }
        }),
    );

    let created = add_todo
        .mutate_async("write tests".to_string(), MutateOptions::new())
        .await?;
    assert_eq!(*created, "created write tests");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(todos.get_current_result().data.as_deref(), Some(&2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_mutate_callbacks_run_after_the_mutation_function() -> Result<()> {
    let client = QueryClient::new();
    let log = Log::default();
    let observer = MutationObserver::new(&client, logged(&log, Duration::ZERO));
    let _subscription = observer.subscribe(|_| {});

    let seen = log.clone();
    observer
        .mutate_async(
            7,
            MutateOptions::new()
                .on_success(move |data, _, _| seen.lock().push(format!("on_success-{data}"))),
        )
        .await?;

    assert_eq!(entries(&log), ["start-7", "finish-7", "on_success-7"]);
    Ok(())
}
