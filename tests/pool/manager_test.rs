//! Tests for the keyed session pool.

use std::time::Duration;

use claude_session_pool::config::PoolConfig;
use claude_session_pool::pool::SessionPool;
use claude_session_pool::session::{RunOptions, SessionError};

use crate::support::{wait_until, FakeWorker, Recorder};

fn config(capacity: usize) -> PoolConfig {
    PoolConfig {
        capacity,
        idle_timeout_secs: 60,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn acquire_creates_session_once_per_key() {
    let pool = SessionPool::new(config(4));
    assert!(pool.is_empty().await);

    let first = pool.acquire(Some("alpha")).await.unwrap();
    let again = pool.acquire(Some("alpha")).await.unwrap();

    assert_eq!(first.key(), "alpha");
    assert_eq!(again.key(), "alpha");
    assert_eq!(pool.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn acquire_without_key_uses_default() {
    let pool = SessionPool::new(PoolConfig {
        default_key: "main".to_string(),
        ..config(2)
    });

    let session = pool.acquire(None).await.unwrap();
    assert_eq!(session.key(), "main");
    assert_eq!(pool.default_key(), "main");
    assert!(pool.contains("main").await);
}

#[tokio::test(start_paused = true)]
async fn full_pool_evicts_least_recently_used() {
    let pool = SessionPool::new(config(2));

    let a = pool.acquire(Some("A")).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(Some("B")).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(Some("C")).await.unwrap();

    assert_eq!(pool.len().await, 2);
    assert!(!pool.contains("A").await);
    assert!(pool.contains("B").await);
    assert!(pool.contains("C").await);
    wait_until(|| a.is_closed()).await;
}

#[tokio::test(start_paused = true)]
async fn access_refreshes_recency() {
    let pool = SessionPool::new(config(2));

    pool.acquire(Some("A")).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(Some("B")).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(Some("A")).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire(Some("C")).await.unwrap();

    assert!(pool.contains("A").await);
    assert!(!pool.contains("B").await);
    assert!(pool.contains("C").await);
}

#[tokio::test(start_paused = true)]
async fn capacity_is_never_exceeded() {
    let pool = SessionPool::new(config(3));

    for i in 0..10 {
        pool.acquire(Some(format!("key-{i}").as_str())).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(pool.len().await <= 3);
    }
    let status = pool.status().await;
    assert_eq!(status.size, 3);
    assert_eq!(status.capacity, 3);
    let keys: Vec<&str> = status.per_channel.iter().map(|c| c.key.as_str()).collect();
    assert_eq!(keys, vec!["key-7", "key-8", "key-9"]);
}

#[tokio::test(start_paused = true)]
async fn zero_capacity_is_treated_as_one() {
    let pool = SessionPool::new(config(0));
    pool.acquire(Some("a")).await.unwrap();
    pool.acquire(Some("b")).await.unwrap();
    assert_eq!(pool.capacity(), 1);
    assert_eq!(pool.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_only_idle_sessions() {
    let pool = SessionPool::new(config(4));

    let old = pool.acquire(Some("old")).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    pool.acquire(Some("fresh")).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;

    let evicted = pool.sweep_idle().await;

    assert_eq!(evicted, vec!["old".to_string()]);
    assert!(pool.contains("fresh").await);
    wait_until(|| old.is_closed()).await;
}

#[tokio::test(start_paused = true)]
async fn background_sweep_reclaims_idle_sessions() {
    let pool = SessionPool::start(PoolConfig {
        idle_timeout_secs: 2,
        sweep_interval_secs: 1,
        ..config(4)
    });

    pool.acquire(Some("a")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(pool.is_empty().await);
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn status_reports_each_channel() {
    let pool = SessionPool::new(config(4));
    pool.acquire(Some("b")).await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    pool.acquire(Some("a")).await.unwrap();

    let status = pool.status().await;
    assert_eq!(status.size, 2);
    assert_eq!(status.per_channel[0].key, "a");
    assert_eq!(status.per_channel[0].idle_seconds, 0);

    let b = status.channel("b").unwrap();
    assert_eq!(b.idle_seconds, 5);
    assert!(!b.alive);
    assert!(!b.busy);
    assert_eq!(b.queue_depth, 0);
    assert_eq!(b.crashes, 0);
    assert!(status.channel("missing").is_none());
}

#[tokio::test(start_paused = true)]
async fn destroy_and_reset_on_missing_keys() {
    let pool = SessionPool::new(config(2));
    pool.acquire(Some("a")).await.unwrap();

    assert!(!pool.destroy("missing").await);
    assert!(!pool.reset_circuit("missing").await);
    assert!(!pool.cancel(Some("missing")).await);
    assert!(!pool.cancel(None).await);

    assert!(pool.reset_circuit("a").await);
    assert!(pool.destroy("a").await);
    assert!(pool.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn shutdown_refuses_new_work() {
    let pool = SessionPool::new(config(2));
    let session = pool.acquire(Some("a")).await.unwrap();

    pool.shutdown().await;

    assert!(pool.is_empty().await);
    assert!(session.is_closed());
    assert!(matches!(
        pool.acquire(Some("a")).await,
        Err(SessionError::ShuttingDown)
    ));
    assert!(matches!(
        pool.run("hi", RunOptions::default()).await,
        Err(SessionError::ShuttingDown)
    ));
}

#[tokio::test]
async fn streaming_run_reports_acquire_failure_to_observer() {
    let pool = SessionPool::new(config(2));
    pool.shutdown().await;
    let recorder = Recorder::new();

    let result = pool
        .run_streaming("hi", recorder.clone(), RunOptions::default())
        .await;

    assert!(matches!(result, Err(SessionError::ShuttingDown)));
    assert_eq!(
        *recorder.errors.lock().unwrap(),
        vec!["Session shutting down"]
    );
}

#[tokio::test]
async fn run_routes_by_key() {
    let worker = FakeWorker::echo();
    let pool = SessionPool::new(worker.pool_config(4));

    let a = pool.run("to a", RunOptions::for_key("a")).await.unwrap();
    let b = pool.run("to b", RunOptions::for_key("b")).await.unwrap();
    let default = pool.run("to default", RunOptions::default()).await.unwrap();

    assert_eq!(a.text, "echo:to a");
    assert_eq!(b.text, "echo:to b");
    assert_eq!(default.text, "echo:to default");
    assert_eq!(pool.len().await, 3);
    assert!(pool.contains("default").await);
    assert_eq!(worker.spawn_count(), 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn run_with_continuation_token_resumes() {
    let worker = FakeWorker::echo();
    let pool = SessionPool::new(worker.pool_config(2));

    let output = pool
        .run(
            "hello",
            RunOptions::for_key("chat").continuation_token("saved-7"),
        )
        .await
        .unwrap();

    assert_eq!(output.text, "echo:hello");
    let args = worker.last_args();
    assert!(args.windows(2).any(|w| w == ["--resume", "saved-7"]), "{args:?}");

    pool.shutdown().await;
}

#[tokio::test]
async fn cancel_without_key_finds_busy_session() {
    let worker = FakeWorker::echo();
    let pool = std::sync::Arc::new(SessionPool::new(worker.pool_config(4)));

    pool.acquire(Some("idle")).await.unwrap();
    let busy = pool.acquire(Some("busy")).await.unwrap();
    let hanging = tokio::spawn({
        let pool = std::sync::Arc::clone(&pool);
        async move { pool.run("hang", RunOptions::for_key("busy")).await }
    });
    wait_until(|| busy.status().busy).await;

    assert!(pool.cancel(None).await);
    assert!(matches!(
        hanging.await.unwrap(),
        Err(SessionError::Cancelled)
    ));

    pool.shutdown().await;
}

#[tokio::test]
async fn eviction_rejects_in_flight_work() {
    let worker = FakeWorker::echo();
    let pool = std::sync::Arc::new(SessionPool::new(worker.pool_config(1)));

    let first = pool.acquire(Some("first")).await.unwrap();
    let hanging = tokio::spawn({
        let pool = std::sync::Arc::clone(&pool);
        async move { pool.run("hang", RunOptions::for_key("first")).await }
    });
    wait_until(|| first.status().busy).await;

    let output = pool.run("hi", RunOptions::for_key("second")).await.unwrap();
    assert_eq!(output.text, "echo:hi");
    assert!(matches!(
        hanging.await.unwrap(),
        Err(SessionError::ShuttingDown)
    ));
    assert!(!pool.contains("first").await);

    pool.shutdown().await;
}
