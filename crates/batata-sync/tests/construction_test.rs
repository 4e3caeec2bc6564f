// Integration tests for client construction and store failures
// Discovery, connection and auth failure matrix, unreachable store, partitions

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use batata_sync::{
    Context, MemoryCluster, StaticRegistry, Sync, SyncError, SyncOptions,
};
use common::{
    SERVICE_NAME, TEST_PASSWORD, TEST_USERNAME, init_tracing, memory_options, new_sync,
    unique_path, wait_until, within,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unregistered_service_fails_discovery() {
    init_tracing();
    let cluster = MemoryCluster::new();
    let registry = StaticRegistry::new().with_service(SERVICE_NAME, cluster.endpoints());
    let options = SyncOptions::new()
        .with_registry(Arc::new(registry))
        .with_connector(cluster.connector());

    let result = Sync::new("no-such-service", options).await;
    match result {
        Err(SyncError::Discovery(name)) => assert_eq!(name, "no-such-service"),
        other => panic!("expected Discovery, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registered_service_connects() -> anyhow::Result<()> {
    init_tracing();
    let cluster = MemoryCluster::new();
    let registry = StaticRegistry::new().with_service(SERVICE_NAME, cluster.endpoints());
    let options = SyncOptions::new()
        .with_registry(Arc::new(registry))
        .with_connector(cluster.connector());

    let sync = Sync::new(SERVICE_NAME, options).await?;
    assert_eq!(sync.service_name(), SERVICE_NAME);
    assert_eq!(sync.endpoints(), cluster.endpoints().as_slice());
    sync.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_store_fails_connection() {
    init_tracing();
    let cluster = MemoryCluster::new();
    let options = SyncOptions::new()
        .with_endpoints(["10.255.255.1:2379"])
        .with_connector(cluster.connector());

    let result = Sync::new(SERVICE_NAME, options).await;
    assert!(matches!(result, Err(SyncError::Connection(_))));
    assert_eq!(cluster.lease_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_etcd_fails_connection() {
    init_tracing();
    let options = SyncOptions::new()
        .with_endpoints(["127.0.0.1:1"])
        .with_dial_timeout(Duration::from_millis(300))
        .with_request_timeout(Duration::from_millis(300));

    let result = within(Duration::from_secs(5), Sync::new(SERVICE_NAME, options)).await;
    assert!(matches!(result, Err(SyncError::Connection(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_credentials_matrix() -> anyhow::Result<()> {
    init_tracing();
    let cluster = MemoryCluster::new().with_user(TEST_USERNAME, TEST_PASSWORD);

    let result = Sync::new(SERVICE_NAME, memory_options(&cluster)).await;
    assert!(matches!(result, Err(SyncError::AuthFailed(_))));

    let result = Sync::new(
        SERVICE_NAME,
        memory_options(&cluster).with_auth(TEST_USERNAME, "wrong"),
    )
    .await;
    assert!(matches!(result, Err(SyncError::AuthFailed(_))));

    let sync = Sync::new(
        SERVICE_NAME,
        memory_options(&cluster).with_auth(TEST_USERNAME, TEST_PASSWORD),
    )
    .await?;
    assert!(cluster.has_lease(sync.lease_id()?));
    sync.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_options_are_rejected() {
    init_tracing();
    let cluster = MemoryCluster::new();
    let result = Sync::new(SERVICE_NAME, memory_options(&cluster).with_ttl(0)).await;
    assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_store_fails_every_call() -> anyhow::Result<()> {
    init_tracing();
    let cluster = MemoryCluster::new();
    let sync = new_sync(&cluster, 5).await;
    let path = unique_path("unreachable");
    let ctx = Context::with_timeout(Duration::from_secs(3));

    cluster.set_available(false);

    let campaign = within(Duration::from_secs(5), sync.campaign_leader(&ctx, &path)).await;
    assert!(campaign.is_err());
    assert!(!matches!(campaign, Err(SyncError::Cancelled(_))));

    let lock = within(Duration::from_secs(5), sync.lock(&ctx, &path)).await;
    assert!(lock.is_err());
    assert!(!matches!(lock, Err(SyncError::Cancelled(_))));

    assert!(sync.try_lock(&path).await.is_err());
    assert!(sync.leader(&path).await.is_err());

    cluster.set_available(true);
    let _ = sync.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partition_longer_than_ttl_loses_leadership() -> anyhow::Result<()> {
    init_tracing();
    let cluster = MemoryCluster::new();
    let path = unique_path("partition");

    let a = new_sync(&cluster, 1).await;
    let b = new_sync(&cluster, 1).await;

    let leader = a.campaign_leader(&Context::background(), &path).await?;
    let old_lease = leader.lease_id();
    let mut status = leader.status();

    cluster.set_available(false);
    assert_eq!(within(Duration::from_secs(3), status.recv()).await, Some(false));
    // Keep B cut off until its own lease is gone as well
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cluster.set_available(true);

    // Both sessions come back with fresh leases
    assert!(
        wait_until(Duration::from_secs(3), || {
            matches!(a.lease_id(), Ok(lease) if lease != old_lease) && b.lease_id().is_ok()
        })
        .await
    );
    assert!(matches!(
        leader.resign(&Context::background()).await,
        Err(SyncError::NotHeld(_))
    ));

    let new_leader = within(
        Duration::from_secs(2),
        b.campaign_leader(&Context::background(), &path),
    )
    .await?;
    assert!(new_leader.is_leader());
    assert!(b.metrics().session_renewed_total.get() >= 1.0);

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_partition_keeps_leadership() -> anyhow::Result<()> {
    init_tracing();
    let cluster = MemoryCluster::new();
    let sync = new_sync(&cluster, 5).await;
    let path = unique_path("partition");

    let leader = sync.campaign_leader(&Context::background(), &path).await?;
    let mut status = leader.status();

    cluster.set_available(false);
    tokio::time::sleep(Duration::from_millis(500)).await;
    cluster.set_available(true);
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(status.try_recv(), None);
    assert!(leader.is_leader());
    assert_eq!(sync.lease_id()?, leader.lease_id());

    // The restored watch still reports a later loss
    assert!(cluster.delete_key(leader.key()));
    assert_eq!(within(Duration::from_secs(3), status.recv()).await, Some(false));

    sync.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_session_lease_is_replaced() -> anyhow::Result<()> {
    init_tracing();
    let cluster = MemoryCluster::new();
    let sync = new_sync(&cluster, 3).await;
    let lease = sync.lease_id()?;

    assert!(cluster.expire_lease(lease));
    assert!(
        wait_until(Duration::from_secs(3), || {
            matches!(sync.lease_id(), Ok(fresh) if fresh != lease)
        })
        .await
    );
    assert!(cluster.has_lease(sync.lease_id()?));
    assert!(!cluster.has_lease(lease));

    // New candidates attach to the replacement lease
    let mutex = sync.lock(&Context::background(), &unique_path("renewed")).await?;
    assert_eq!(mutex.lease_id(), sync.lease_id()?);

    sync.close().await?;
    assert!(sync.is_closed());
    assert!(matches!(sync.lease_id(), Err(SyncError::Closed)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_options_from_config_file() -> anyhow::Result<()> {
    init_tracing();
    let cluster = MemoryCluster::new().with_user(TEST_USERNAME, TEST_PASSWORD);
    let endpoint = cluster.endpoints()[0].address.clone();

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    writeln!(
        file,
        "[sync]\nttl = 4\nusername = \"{}\"\npassword = \"{}\"\nendpoints = \"{}\"\ncandidate_id = \"from-file\"",
        TEST_USERNAME, TEST_PASSWORD, endpoint
    )?;

    let options = SyncOptions::load(Some(file.path()))?.with_connector(cluster.connector());
    let sync = Sync::new(SERVICE_NAME, options).await?;
    assert_eq!(sync.candidate_id(), "from-file");

    sync.close().await?;
    Ok(())
}
