//! The `Sync` coordination client

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::candidate::{self, AcquireMode, CandidateRequest};
use crate::config::SyncOptions;
use crate::context::Context;
use crate::discovery::{DnsResolver, Endpoint, Resolver, shuffle_endpoints};
use crate::election::{Leader, LeaderInfo};
use crate::error::{Result, SyncError};
use crate::lock::Mutex;
use crate::metrics::{KIND_LEADER, KIND_LOCK, SyncMetrics};
use crate::session::Session;
use crate::store::{CoordinationStore, LeaseId};

struct SyncInner {
    service_name: String,
    endpoints: Vec<Endpoint>,
    store: Arc<dyn CoordinationStore>,
    session: Session,
    metrics: Arc<SyncMetrics>,
    candidate_id: String,
    closed: AtomicBool,
}

/// Coordination client: one store connection and one session lease.
///
/// Cloning is cheap and every clone shares the same session, so keys
/// created through any clone live and die with the same lease.
///
/// ```no_run
/// use std::time::Duration;
///
/// use batata_sync::{Context, Sync, SyncOptions};
///
/// # async fn run() -> batata_sync::Result<()> {
/// let sync = Sync::new("etcd.internal", SyncOptions::new().with_ttl(10)).await?;
///
/// let ctx = Context::background();
/// let leader = sync.campaign_leader(&ctx, "/election/scheduler").await?;
/// let mut status = leader.status();
/// tokio::select! {
///     _ = status.recv() => { /* leadership lost */ }
///     _ = tokio::time::sleep(Duration::from_secs(60)) => leader.resign(&ctx).await?,
/// }
///
/// sync.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Sync {
    inner: Arc<SyncInner>,
}

impl Sync {
    /// Resolve `service_name`, connect, authenticate and start the session.
    ///
    /// Fails with [`SyncError::Discovery`] when the name resolves to no
    /// endpoints, [`SyncError::Connection`] when none is reachable and
    /// [`SyncError::AuthFailed`] when the credentials are rejected.
    pub async fn new(service_name: &str, options: SyncOptions) -> Result<Self> {
        options.validate()?;

        let resolver: Arc<dyn Resolver> = match &options.registry {
            Some(registry) => registry.clone(),
            None => Arc::new(DnsResolver::default()),
        };
        let mut endpoints = resolver.resolve(service_name).await?;
        if endpoints.is_empty() {
            return Err(SyncError::Discovery(service_name.to_string()));
        }
        shuffle_endpoints(&mut endpoints);

        let store = options
            .connector
            .connect(
                &endpoints,
                options.credentials.as_ref(),
                &options.connect_options(),
            )
            .await?;

        let metrics = Arc::new(SyncMetrics::new().map_err(anyhow::Error::from)?);

        let session = match Session::start(
            store.clone(),
            options.ttl,
            options.heartbeat_interval(),
            metrics.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                store.close().await;
                return Err(e);
            }
        };

        info!(
            service = %service_name,
            endpoints = endpoints.len(),
            candidate_id = %options.candidate_id,
            "sync client started"
        );

        Ok(Self {
            inner: Arc::new(SyncInner {
                service_name: service_name.to_string(),
                endpoints,
                store,
                session,
                metrics,
                candidate_id: options.candidate_id,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    fn request<'a>(
        &'a self,
        kind: &'static str,
        path: &'a str,
        mode: AcquireMode,
    ) -> CandidateRequest<'a> {
        CandidateRequest {
            kind,
            path,
            value: self.inner.candidate_id.as_bytes(),
            mode,
        }
    }

    /// Wait until this client leads `path` or `ctx` ends.
    ///
    /// On cancellation the candidate key is removed and
    /// [`SyncError::Cancelled`] is returned.
    pub async fn campaign_leader(&self, ctx: &Context, path: &str) -> Result<Leader> {
        self.ensure_open()?;
        let inner = &self.inner;
        candidate::acquire(
            ctx,
            &inner.store,
            &inner.session,
            &inner.metrics,
            self.request(KIND_LEADER, path, AcquireMode::Wait),
        )
        .await
        .map(Leader::new)
    }

    /// Wait until this client owns the lock on `path` or `ctx` ends.
    pub async fn lock(&self, ctx: &Context, path: &str) -> Result<Mutex> {
        self.ensure_open()?;
        let inner = &self.inner;
        candidate::acquire(
            ctx,
            &inner.store,
            &inner.session,
            &inner.metrics,
            self.request(KIND_LOCK, path, AcquireMode::Wait),
        )
        .await
        .map(Mutex::new)
    }

    /// Take the lock on `path` only if nobody holds or waits for it.
    ///
    /// Fails with [`SyncError::Locked`] otherwise, leaving no key behind.
    pub async fn try_lock(&self, path: &str) -> Result<Mutex> {
        self.ensure_open()?;
        let inner = &self.inner;
        candidate::acquire(
            &Context::background(),
            &inner.store,
            &inner.session,
            &inner.metrics,
            self.request(KIND_LOCK, path, AcquireMode::Try),
        )
        .await
        .map(Mutex::new)
    }

    /// Current holder of `path`, whoever it is.
    pub async fn leader(&self, path: &str) -> Result<Option<LeaderInfo>> {
        self.ensure_open()?;
        Ok(candidate::current_holder(&self.inner.store, path)
            .await?
            .map(LeaderInfo::from))
    }

    /// Lease currently backing this client's keys.
    pub fn lease_id(&self) -> Result<LeaseId> {
        self.ensure_open()?;
        self.inner.session.lease_id()
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.inner.endpoints
    }

    pub fn candidate_id(&self) -> &str {
        &self.inner.candidate_id
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.inner.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop the heartbeat, revoke the lease and close the store client.
    ///
    /// Revoking the lease deletes every key created through this client.
    /// Later calls return [`SyncError::Closed`]; closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let revoked = self.inner.session.close().await;
        self.inner.store.close().await;

        match revoked {
            Ok(()) => {
                info!(service = %self.inner.service_name, "sync client closed");
                Ok(())
            }
            Err(e) => {
                warn!(service = %self.inner.service_name, error = %e, "sync client closed without revoking its lease");
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Sync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sync")
            .field("service_name", &self.inner.service_name)
            .field("endpoints", &self.inner.endpoints)
            .field("candidate_id", &self.inner.candidate_id)
            .field("session", &self.inner.session.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCluster;

    fn options(cluster: &MemoryCluster) -> SyncOptions {
        SyncOptions::new()
            .with_endpoints(cluster.endpoints())
            .with_connector(cluster.connector())
            .with_ttl(5)
    }

    #[tokio::test]
    async fn test_new_and_close() {
        let cluster = MemoryCluster::new();
        let sync = Sync::new("etcd", options(&cluster)).await.unwrap();
        let lease = sync.lease_id().unwrap();
        assert!(cluster.has_lease(lease));

        sync.close().await.unwrap();
        assert!(sync.is_closed());
        assert!(!cluster.has_lease(lease));
        assert!(matches!(sync.lease_id(), Err(SyncError::Closed)));
        assert!(matches!(
            sync.campaign_leader(&Context::background(), "/election/a").await,
            Err(SyncError::Closed)
        ));

        sync.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_deletes_keys() {
        let cluster = MemoryCluster::new();
        let sync = Sync::new("etcd", options(&cluster)).await.unwrap();
        let _leader = sync
            .campaign_leader(&Context::background(), "/election/a")
            .await
            .unwrap();
        assert_eq!(cluster.keys("/election/a/").len(), 1);

        sync.close().await.unwrap();
        assert!(cluster.keys("/election/a/").is_empty());
    }

    #[tokio::test]
    async fn test_leader_query() {
        let cluster = MemoryCluster::new();
        let sync = Sync::new("etcd", options(&cluster).with_candidate_id("node-a"))
            .await
            .unwrap();
        assert!(sync.leader("/election/a").await.unwrap().is_none());

        let leader = sync
            .campaign_leader(&Context::background(), "/election/a")
            .await
            .unwrap();
        let info = sync.leader("/election/a").await.unwrap().unwrap();
        assert_eq!(info.key, leader.key());
        assert_eq!(info.candidate_id, "node-a");
        assert_eq!(info.lease_id, sync.lease_id().unwrap());
    }

    #[tokio::test]
    async fn test_metrics_record_acquire() {
        let cluster = MemoryCluster::new();
        let sync = Sync::new("etcd", options(&cluster)).await.unwrap();
        let _mutex = sync.try_lock("/lock/a").await.unwrap();
        assert!(matches!(
            sync.try_lock("/lock/a").await,
            Err(SyncError::Locked(_))
        ));

        let text = sync.metrics().gather();
        assert!(text.contains("batata_sync_acquire_total{kind=\"lock\",result=\"success\"} 1"));
        assert!(text.contains("batata_sync_acquire_total{kind=\"lock\",result=\"locked\"} 1"));
    }
}
