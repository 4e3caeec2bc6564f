//! Distributed locks against a live etcd cluster
//!
//! These tests require a running etcd (v3 API).
//! Run: cargo test --test etcd_lock_test -- --ignored

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use batata_sync::{CancelReason, Context, SyncError};
use common::{connect, init_tracing, unique_path};

#[tokio::test]
#[ignore]
async fn test_lock_excludes_concurrent_holders() -> anyhow::Result<()> {
    init_tracing();
    let path = unique_path("lock");
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let sync = connect(5).await?;
        let (path, inside, max_inside) = (path.clone(), inside.clone(), max_inside.clone());
        tasks.push(tokio::spawn(async move {
            let ctx = Context::with_timeout(Duration::from_secs(20));
            for _ in 0..3 {
                let mutex = sync.lock(&ctx, &path).await?;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                mutex.unlock(&ctx).await?;
            }
            sync.close().await
        }));
    }

    for task in tasks {
        task.await??;
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    println!("✓ no overlapping critical sections");
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_try_lock_reports_locked() -> anyhow::Result<()> {
    init_tracing();
    let a = connect(5).await?;
    let b = connect(5).await?;
    let path = unique_path("lock");

    let mutex = a.try_lock(&path).await?;
    assert!(matches!(b.try_lock(&path).await, Err(SyncError::Locked(_))));

    mutex.unlock(&Context::background()).await?;
    let mutex = b.try_lock(&path).await?;
    assert!(mutex.is_owner());

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_deadline_while_waiting() -> anyhow::Result<()> {
    init_tracing();
    let a = connect(5).await?;
    let b = connect(5).await?;
    let path = unique_path("lock");

    let _held = a.lock(&Context::background(), &path).await?;
    let ctx = Context::with_timeout(Duration::from_millis(500));
    let result = b.lock(&ctx, &path).await;
    assert!(matches!(
        result,
        Err(SyncError::Cancelled(CancelReason::DeadlineExceeded))
    ));

    a.close().await?;
    // With the holder gone the path is free again
    let mutex = b.try_lock(&path).await?;
    assert!(mutex.is_owner());

    b.close().await?;
    Ok(())
}
