//! Shared setup for live etcd tests
//!
//! Endpoints and credentials come from the environment:
//! - `ETCD_ENDPOINTS`: comma-separated `host:port` list (default `127.0.0.1:2379`)
//! - `ETCD_USER` / `ETCD_PASSWORD`: optional, for clusters with auth enabled

#![allow(dead_code)]

use std::time::Duration;

use batata_sync::{Sync, SyncOptions};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_ENDPOINTS: &str = "127.0.0.1:2379";
pub const SERVICE_NAME: &str = "etcd";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .unwrap_or_else(|_| DEFAULT_ENDPOINTS.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn options(ttl_secs: u64) -> SyncOptions {
    let options = SyncOptions::new()
        .with_endpoints(endpoints())
        .with_ttl(ttl_secs)
        .with_dial_timeout(Duration::from_secs(3));

    match (std::env::var("ETCD_USER"), std::env::var("ETCD_PASSWORD")) {
        (Ok(user), Ok(password)) => options.with_auth(&user, &password),
        _ => options,
    }
}

pub async fn connect(ttl_secs: u64) -> anyhow::Result<Sync> {
    Ok(Sync::new(SERVICE_NAME, options(ttl_secs)).await?)
}

pub fn unique_path(prefix: &str) -> String {
    format!("/batata-sync-test/{}/{}", prefix, uuid::Uuid::new_v4().simple())
}
