//! Common test utilities for integration testing
//!
//! Every test runs against its own in-process `MemoryCluster`, so tests
//! can run in parallel without sharing keys.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use batata_sync::{MemoryCluster, Sync, SyncOptions};
use tracing_subscriber::EnvFilter;

/// Default test credentials
pub const TEST_USERNAME: &str = "root";
pub const TEST_PASSWORD: &str = "batata";

/// Service name the store is registered under
pub const SERVICE_NAME: &str = "coordination";

/// Install a fmt subscriber honoring `RUST_LOG` (once per test binary).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Options pointing at `cluster`.
pub fn memory_options(cluster: &MemoryCluster) -> SyncOptions {
    SyncOptions::new()
        .with_endpoints(cluster.endpoints())
        .with_connector(cluster.connector())
}

/// A `Sync` connected to `cluster` with the given lease TTL.
pub async fn new_sync(cluster: &MemoryCluster, ttl_secs: u64) -> Sync {
    Sync::new(SERVICE_NAME, memory_options(cluster).with_ttl(ttl_secs))
        .await
        .expect("failed to connect to memory cluster")
}

/// Generate a unique path to avoid conflicts between tests
pub fn unique_path(prefix: &str) -> String {
    format!("/{}/{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future`, failing the test if it takes longer than `timeout`.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation did not finish in time")
}
