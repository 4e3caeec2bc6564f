//! In-process coordination cluster
//!
//! `MemoryCluster` is a linearizable single-process store with a global
//! revision counter, TTL leases and key watches. Clients connect to it
//! through [`MemoryCluster::connector`] exactly as they would connect to a
//! remote cluster, so a [`crate::Sync`] runs unchanged against it.
//!
//! Fault injection (`set_available`, `expire_lease`, `delete_key`) allows
//! partition and lease-expiry scenarios to be driven from tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    ConnectOptions, Connector, CoordinationStore, Credentials, KeyValue, LeaseId, Revision,
    WatchEvent, WatchStream,
};
use crate::discovery::Endpoint;
use crate::error::{Result, SyncError};

/// How often the sweeper looks for expired leases.
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    id: u64,
    key: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

#[derive(Default)]
struct ClusterState {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
}

impl ClusterState {
    fn notify(&mut self, event: WatchEvent) {
        let key = match &event {
            WatchEvent::Put(kv) => kv.key.as_str(),
            WatchEvent::Delete { key, .. } => key.as_str(),
        };
        let key = key.to_string();
        self.watchers.retain(|watcher| {
            let open = if watcher.key != key {
                !watcher.tx.is_closed()
            } else {
                watcher.tx.send(Ok(event.clone())).is_ok()
            };
            if !open {
                debug!(watch_id = watcher.id, key = %watcher.key, "watch dropped");
            }
            open
        });
    }

    /// Delete `key` at a new revision regardless of its creation revision.
    fn delete(&mut self, key: &str) -> bool {
        if !self.kvs.contains_key(key) {
            return false;
        }
        self.revision += 1;
        let revision = self.revision;
        self.remove_key(key, revision).is_some()
    }

    /// Remove a key at the given revision, detaching it from its lease.
    fn remove_key(&mut self, key: &str, revision: Revision) -> Option<KeyValue> {
        let kv = self.kvs.remove(key)?;
        if kv.lease != 0
            && let Some(lease) = self.leases.get_mut(&kv.lease)
        {
            lease.keys.remove(key);
        }
        self.notify(WatchEvent::Delete {
            key: key.to_string(),
            revision,
        });
        Some(kv)
    }

    /// Drop a lease and all keys attached to it in a single revision.
    fn revoke(&mut self, lease_id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return false;
        };
        if !lease.keys.is_empty() {
            self.revision += 1;
            let revision = self.revision;
            for key in lease.keys {
                self.remove_key(&key, revision);
            }
        }
        true
    }

    fn fail_watchers(&mut self, reason: &str) {
        for watcher in self.watchers.drain(..) {
            debug!(watch_id = watcher.id, key = %watcher.key, reason, "watch broken");
            let _ = watcher
                .tx
                .send(Err(SyncError::Connection(reason.to_string())));
        }
    }
}

struct ClusterInner {
    state: Mutex<ClusterState>,
    endpoints: Vec<Endpoint>,
    users: RwLock<HashMap<String, String>>,
    available: AtomicBool,
    next_watcher_id: AtomicU64,
}

impl ClusterInner {
    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Connection("cluster unavailable".to_string()))
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            debug!(lease = %format!("{:x}", lease_id), "lease expired");
            state.revoke(lease_id);
        }
    }
}

/// In-process coordination cluster.
///
/// Must be created inside a Tokio runtime: a background sweeper expires
/// leases whose TTL elapsed without a keep-alive. The sweeper stops when
/// the last handle to the cluster is dropped.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    /// A cluster advertising the single endpoint `memory-0:2379`.
    pub fn new() -> Self {
        Self::with_endpoints(["memory-0:2379"])
    }

    pub fn with_endpoints<I, E>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        let inner = Arc::new(ClusterInner {
            state: Mutex::new(ClusterState {
                next_lease_id: 0x694d_0000_0001,
                ..Default::default()
            }),
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            users: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            next_watcher_id: AtomicU64::new(1),
        });

        spawn_sweeper(Arc::downgrade(&inner));

        Self { inner }
    }

    /// Enable authentication with the given user.
    pub fn with_user(self, username: &str, password: &str) -> Self {
        self.add_user(username, password);
        self
    }

    pub fn add_user(&self, username: &str, password: &str) {
        self.inner
            .users
            .write()
            .insert(username.to_string(), password.to_string());
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.endpoints.clone()
    }

    /// Connector dialing this cluster.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            cluster: self.inner.clone(),
        })
    }

    /// Make the whole cluster (un)reachable. While unavailable every client
    /// call fails and open watches are broken; leases keep expiring.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            self.inner.state.lock().fail_watchers("cluster unavailable");
        }
        info!(available, "memory cluster availability changed");
    }

    /// Expire a lease immediately, as if its TTL elapsed.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.inner.state.lock().revoke(lease)
    }

    /// Delete a key from outside any client session.
    pub fn delete_key(&self, key: &str) -> bool {
        self.inner.state.lock().delete(key)
    }

    /// Snapshot of the keys under `prefix`, ordered by creation revision.
    pub fn keys(&self, prefix: &str) -> Vec<KeyValue> {
        let state = self.inner.state.lock();
        let mut kvs: Vec<KeyValue> = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        kvs.sort_by_key(|kv| kv.create_revision);
        kvs
    }

    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    pub fn has_lease(&self, lease: LeaseId) -> bool {
        self.inner.state.lock().leases.contains_key(&lease)
    }

    pub fn revision(&self) -> Revision {
        self.inner.state.lock().revision
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_sweeper(cluster: Weak<ClusterInner>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LEASE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let Some(cluster) = cluster.upgrade() else {
                break;
            };
            cluster.sweep_expired();
        }
    });
}

struct MemoryConnector {
    cluster: Arc<ClusterInner>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoints: &[Endpoint],
        credentials: Option<&Credentials>,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn CoordinationStore>> {
        let reachable = endpoints
            .iter()
            .find(|endpoint| self.cluster.endpoints.contains(endpoint));

        let Some(endpoint) = reachable else {
            return Err(SyncError::Connection(format!(
                "no reachable endpoint among {:?}",
                endpoints.iter().map(|e| e.address.as_str()).collect::<Vec<_>>()
            )));
        };
        self.cluster.ensure_available()?;

        {
            let users = self.cluster.users.read();
            if !users.is_empty() {
                let Some(credentials) = credentials else {
                    return Err(SyncError::AuthFailed(
                        "authentication is required".to_string(),
                    ));
                };
                if users.get(&credentials.username) != Some(&credentials.password) {
                    return Err(SyncError::AuthFailed(
                        "invalid username or password".to_string(),
                    ));
                }
            }
        }

        debug!(endpoint = %endpoint, "connected to memory cluster");

        Ok(Arc::new(MemoryStore {
            cluster: self.cluster.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Client of a [`MemoryCluster`].
pub struct MemoryStore {
    cluster: Arc<ClusterInner>,
    closed: AtomicBool,
}

impl MemoryStore {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Connection("client is closed".to_string()));
        }
        self.cluster.ensure_available()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        self.check()?;
        if ttl_secs <= 0 {
            return Err(SyncError::InvalidConfig(format!(
                "lease TTL must be positive, got {}",
                ttl_secs
            )));
        }
        let ttl = Duration::from_secs(ttl_secs as u64);
        let mut state = self.cluster.state.lock();
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<i64> {
        self.check()?;
        let mut state = self.cluster.state.lock();
        let record = state
            .leases
            .get_mut(&lease)
            .ok_or(SyncError::LeaseExpired(lease))?;
        record.deadline = Instant::now() + record.ttl;
        Ok(record.ttl.as_secs() as i64)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check()?;
        if self.cluster.state.lock().revoke(lease) {
            Ok(())
        } else {
            Err(SyncError::LeaseExpired(lease))
        }
    }

    async fn create(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<Option<KeyValue>> {
        self.check()?;
        let mut state = self.cluster.state.lock();
        if state.kvs.contains_key(key) {
            return Ok(None);
        }
        if lease != 0 && !state.leases.contains_key(&lease) {
            return Err(SyncError::LeaseExpired(lease));
        }

        state.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            create_revision: state.revision,
            mod_revision: state.revision,
            lease,
        };
        if let Some(record) = state.leases.get_mut(&lease) {
            record.keys.insert(key.to_string());
        }
        state.kvs.insert(key.to_string(), kv.clone());
        state.notify(WatchEvent::Put(kv.clone()));
        Ok(Some(kv))
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check()?;
        Ok(self.cluster.state.lock().kvs.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check()?;
        let state = self.cluster.state.lock();
        let mut kvs: Vec<KeyValue> = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        kvs.sort_by_key(|kv| kv.create_revision);
        Ok(kvs)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.cluster.state.lock().delete(key))
    }

    async fn delete_if_created(&self, key: &str, create_revision: Revision) -> Result<bool> {
        self.check()?;
        let mut state = self.cluster.state.lock();
        match state.kvs.get(key) {
            Some(kv) if kv.create_revision == create_revision => {
                state.revision += 1;
                let revision = state.revision;
                Ok(state.remove_key(key, revision).is_some())
            }
            _ => Ok(false),
        }
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.cluster.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.cluster.state.lock().watchers.push(Watcher {
            id,
            key: key.to_string(),
            tx,
        });
        debug!(watch_id = id, key = %key, "watch registered");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(cluster: &MemoryCluster) -> Arc<dyn CoordinationStore> {
        cluster
            .connector()
            .connect(&cluster.endpoints(), None, &ConnectOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_revisions() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let lease = store.grant_lease(10).await.unwrap();

        let a = store.create("/p/a", b"a", lease).await.unwrap().unwrap();
        let b = store.create("/p/b", b"b", lease).await.unwrap().unwrap();
        assert!(b.create_revision > a.create_revision);

        // Existing key is not overwritten
        assert!(store.create("/p/a", b"x", lease).await.unwrap().is_none());
        assert_eq!(store.get("/p/a").await.unwrap().unwrap().value, b"a");
    }

    #[tokio::test]
    async fn test_get_prefix_orders_by_create_revision() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let lease = store.grant_lease(10).await.unwrap();

        store.create("/p/zzz", b"", lease).await.unwrap();
        store.create("/p/aaa", b"", lease).await.unwrap();
        store.create("/q/other", b"", lease).await.unwrap();

        let keys: Vec<String> = store
            .get_prefix("/p/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/p/zzz", "/p/aaa"]);
    }

    #[tokio::test]
    async fn test_revoke_deletes_attached_keys() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let lease = store.grant_lease(10).await.unwrap();
        store.create("/p/a", b"", lease).await.unwrap();
        store.create("/p/b", b"", lease).await.unwrap();

        store.revoke_lease(lease).await.unwrap();
        assert!(cluster.keys("/p/").is_empty());
        assert!(matches!(
            store.keep_alive(lease).await,
            Err(SyncError::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_expires_without_keep_alive() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let lease = store.grant_lease(1).await.unwrap();
        store.create("/p/a", b"", lease).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(!cluster.has_lease(lease));
        assert!(store.get("/p/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keep_alive_extends_lease() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let lease = store.grant_lease(1).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(store.keep_alive(lease).await.unwrap(), 1);
        }
        assert!(cluster.has_lease(lease));
    }

    #[tokio::test]
    async fn test_delete_if_created_checks_revision() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let lease = store.grant_lease(10).await.unwrap();
        let kv = store.create("/p/a", b"", lease).await.unwrap().unwrap();

        assert!(!store.delete_if_created("/p/a", kv.create_revision + 1).await.unwrap());
        assert!(store.delete_if_created("/p/a", kv.create_revision).await.unwrap());
        assert!(!store.delete_if_created("/p/a", kv.create_revision).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_detaches_key_from_lease() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let lease = store.grant_lease(10).await.unwrap();
        store.create("/p/a", b"", lease).await.unwrap();
        let mut watch = store.watch("/p/a").await.unwrap();

        assert!(store.delete("/p/a").await.unwrap());
        assert!(!store.delete("/p/a").await.unwrap());
        assert!(watch.next().await.unwrap().unwrap().is_delete());
        assert!(store.get("/p/a").await.unwrap().is_none());

        // Revoking the lease later does not resurrect or re-delete the key
        assert!(cluster.expire_lease(lease));
        assert!(cluster.keys("/p/").is_empty());
    }

    #[tokio::test]
    async fn test_watch_reports_delete() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let lease = store.grant_lease(10).await.unwrap();
        store.create("/p/a", b"", lease).await.unwrap();

        let mut watch = store.watch("/p/a").await.unwrap();
        assert!(cluster.delete_key("/p/a"));

        let event = watch.next().await.unwrap().unwrap();
        assert!(event.is_delete());
    }

    #[tokio::test]
    async fn test_unavailable_cluster_breaks_watches_and_calls() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        let mut watch = store.watch("/p/a").await.unwrap();

        cluster.set_available(false);
        assert!(matches!(watch.next().await, Some(Err(SyncError::Connection(_)))));
        assert!(matches!(
            store.grant_lease(10).await,
            Err(SyncError::Connection(_))
        ));

        cluster.set_available(true);
        assert!(store.grant_lease(10).await.is_ok());
    }

    #[tokio::test]
    async fn test_connector_checks_endpoints_and_credentials() {
        let cluster = MemoryCluster::new().with_user("root", "secret");
        let connector = cluster.connector();
        let options = ConnectOptions::default();

        let unknown = [Endpoint::new("10.255.0.1:2379")];
        assert!(matches!(
            connector.connect(&unknown, None, &options).await,
            Err(SyncError::Connection(_))
        ));

        let endpoints = cluster.endpoints();
        assert!(matches!(
            connector.connect(&endpoints, None, &options).await,
            Err(SyncError::AuthFailed(_))
        ));

        let wrong = Credentials::new("root", "wrong");
        assert!(matches!(
            connector.connect(&endpoints, Some(&wrong), &options).await,
            Err(SyncError::AuthFailed(_))
        ));

        let right = Credentials::new("root", "secret");
        assert!(connector.connect(&endpoints, Some(&right), &options).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let cluster = MemoryCluster::new();
        let store = connect(&cluster).await;
        store.close().await;
        assert!(store.grant_lease(10).await.is_err());
    }
}
