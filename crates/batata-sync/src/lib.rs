//! Batata Sync - leader election and distributed locks
//!
//! This crate layers a client-side coordination protocol over a
//! linearizable key-value store with leases and a global revision counter
//! (etcd v3 in production, [`MemoryCluster`] in tests):
//! - Leader election ([`Sync::campaign_leader`])
//! - Distributed mutual exclusion ([`Sync::lock`], [`Sync::try_lock`])
//! - Lease-backed session with heartbeat and automatic recovery
//! - Single-fire status-loss notification ([`Status`])
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use batata_sync::{Context, Sync, SyncOptions};
//!
//! # async fn run() -> batata_sync::Result<()> {
//! let options = SyncOptions::new()
//!     .with_endpoints(["127.0.0.1:2379"])
//!     .with_auth("root", "secret");
//! let sync = Sync::new("etcd", options).await?;
//!
//! let ctx = Context::with_timeout(Duration::from_secs(30));
//! let mutex = sync.lock(&ctx, "/lock/billing").await?;
//! // critical section
//! mutex.unlock(&ctx).await?;
//!
//! sync.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod candidate;
pub mod client;
pub mod config;
pub mod context;
pub mod discovery;
pub mod election;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod session;
pub mod store;

pub use candidate::Status;
pub use client::Sync;
pub use config::SyncOptions;
pub use context::{CancelReason, Context};
pub use discovery::{DnsResolver, Endpoint, NacosRegistry, Resolver, StaticRegistry};
pub use election::{Leader, LeaderInfo};
pub use error::{Result, SyncError};
pub use lock::Mutex;
pub use metrics::SyncMetrics;
pub use session::SessionState;
pub use store::etcd::{EtcdConnector, EtcdStore};
pub use store::memory::MemoryCluster;
pub use store::{Connector, CoordinationStore, Credentials, KeyValue, LeaseId, Revision};
