//! Coordination store client abstraction
//!
//! The coordination protocol needs a small set of primitives from the
//! store: leases with TTL, key creation attached to a lease, prefix reads
//! ordered by creation revision, compare-and-delete, and key watches.
//! Any linearizable store with a global monotonic revision counter that
//! offers them can back a [`crate::Sync`].
//!
//! Implementations:
//! - [`etcd::EtcdStore`]: etcd v3 gRPC API
//! - [`memory::MemoryStore`]: in-process cluster for tests and embedding

pub mod etcd;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::discovery::Endpoint;
use crate::error::Result;

/// Lease identifier assigned by the store.
pub type LeaseId = i64;

/// Store-wide revision counter value.
pub type Revision = i64;

/// A key as stored, with its revision metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: LeaseId,
}

impl KeyValue {
    /// Value decoded as UTF-8, lossy.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Change observed on a watched key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, revision: Revision },
}

impl WatchEvent {
    pub fn is_delete(&self) -> bool {
        matches!(self, WatchEvent::Delete { .. })
    }
}

/// Stream of watch events; an `Err` item means the watch is broken.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Username/password pair for store authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Timeouts applied by a [`Connector`].
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Client-side view of the coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Grant a lease with the given TTL in seconds.
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Renew a lease once. Returns the remaining TTL in seconds, or
    /// [`crate::SyncError::LeaseExpired`] if the lease is gone.
    async fn keep_alive(&self, lease: LeaseId) -> Result<i64>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Create `key` attached to `lease` if it does not exist.
    ///
    /// Returns the created key, or `None` if the key already existed.
    async fn create(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<Option<KeyValue>>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All keys under `prefix`, ordered by creation revision ascending.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Delete `key`; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete `key` only if its creation revision still equals
    /// `create_revision`; returns whether it was deleted.
    async fn delete_if_created(&self, key: &str, create_revision: Revision) -> Result<bool>;

    /// Watch `key` for changes made after the watch is registered.
    async fn watch(&self, key: &str) -> Result<WatchStream>;

    /// Close the client; later calls fail.
    async fn close(&self);
}

/// Establishes store clients from resolved endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to the first reachable endpoint and authenticate.
    ///
    /// Fails with [`crate::SyncError::Connection`] when no endpoint is
    /// reachable and [`crate::SyncError::AuthFailed`] when the credentials
    /// are rejected.
    async fn connect(
        &self,
        endpoints: &[Endpoint],
        credentials: Option<&Credentials>,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn CoordinationStore>>;
}

/// Exclusive upper bound of the key range sharing `prefix`.
pub(crate) fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All bytes were 0xff: the range extends to the end of the keyspace.
    vec![0]
}
