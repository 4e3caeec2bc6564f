//! etcd v3 backed coordination store
//!
//! Talks to etcd over its gRPC API with hand-declared prost messages (see
//! [`proto`]). A failed call is retried once: on `Unavailable` after
//! rotating to the next reachable member, on `Unauthenticated` after
//! refreshing the auth token.

pub mod proto;
mod rpc;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use self::proto::{
    Compare, CompareResult, CompareTarget, DeleteRangeRequest, EventType, LeaseGrantRequest,
    LeaseRevokeRequest, PutRequest, RangeRequest, RequestOp, SortOrder, SortTarget, TxnRequest,
    compare, request_op, response_op,
};
use self::rpc::RpcChannel;
use super::{
    ConnectOptions, Connector, CoordinationStore, Credentials, KeyValue, LeaseId, Revision,
    WatchEvent, WatchStream, prefix_range_end,
};
use crate::discovery::Endpoint;
use crate::error::{Result, SyncError};

impl From<proto::KeyValue> for KeyValue {
    fn from(kv: proto::KeyValue) -> Self {
        Self {
            key: String::from_utf8_lossy(&kv.key).into_owned(),
            value: kv.value,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            lease: kv.lease,
        }
    }
}

fn to_watch_event(event: proto::Event) -> Option<WatchEvent> {
    let kv = event.kv?;
    match EventType::try_from(event.r#type) {
        Ok(EventType::Put) => Some(WatchEvent::Put(kv.into())),
        Ok(EventType::Delete) => Some(WatchEvent::Delete {
            key: String::from_utf8_lossy(&kv.key).into_owned(),
            revision: kv.mod_revision,
        }),
        Err(_) => None,
    }
}

/// Connector dialing etcd members over gRPC.
#[derive(Clone, Copy, Debug, Default)]
pub struct EtcdConnector;

#[async_trait]
impl Connector for EtcdConnector {
    async fn connect(
        &self,
        endpoints: &[Endpoint],
        credentials: Option<&Credentials>,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn CoordinationStore>> {
        let store = EtcdStore::connect(endpoints, credentials, options).await?;
        Ok(Arc::new(store))
    }
}

/// etcd client with member rotation and token refresh.
pub struct EtcdStore {
    endpoints: Vec<Endpoint>,
    credentials: Option<Credentials>,
    options: ConnectOptions,
    rpc: RwLock<Arc<RpcChannel>>,
    current_endpoint_index: AtomicUsize,
    reconnecting: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl EtcdStore {
    /// Connect to the first reachable member of `endpoints`.
    pub async fn connect(
        endpoints: &[Endpoint],
        credentials: Option<&Credentials>,
        options: &ConnectOptions,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(SyncError::Connection("no endpoints to dial".to_string()));
        }

        let (index, rpc) = dial_any(endpoints, 0, credentials, options).await?;
        info!(endpoint = %rpc.endpoint, "connected to etcd");

        Ok(Self {
            endpoints: endpoints.to_vec(),
            credentials: credentials.cloned(),
            options: options.clone(),
            rpc: RwLock::new(Arc::new(rpc)),
            current_endpoint_index: AtomicUsize::new(index),
            reconnecting: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Member the client currently talks to.
    pub fn current_endpoint(&self) -> Endpoint {
        self.rpc.read().endpoint.clone()
    }

    fn rpc(&self) -> Arc<RpcChannel> {
        self.rpc.read().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SyncError::Connection("client is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Run `f` once, retrying after reconnect or re-authentication.
    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<RpcChannel>) -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        self.ensure_open()?;
        let rpc = self.rpc();
        match f(rpc.clone()).await {
            Ok(value) => Ok(value),
            Err(status) if status.code() == Code::Unavailable => {
                warn!(op, endpoint = %rpc.endpoint, error = %status.message(), "etcd member unavailable");
                self.reconnect(&rpc).await?;
                Ok(f(self.rpc()).await?)
            }
            Err(status) if status.code() == Code::Unauthenticated && self.credentials.is_some() => {
                debug!(op, error = %status.message(), "auth token rejected, re-authenticating");
                self.refresh_token(&rpc).await?;
                Ok(f(self.rpc()).await?)
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Replace `stale` with a channel to the next reachable member.
    async fn reconnect(&self, stale: &Arc<RpcChannel>) -> Result<()> {
        let _guard = self.reconnecting.lock().await;
        if !Arc::ptr_eq(stale, &self.rpc()) {
            return Ok(());
        }

        let start = self.current_endpoint_index.load(Ordering::Relaxed) + 1;
        let (index, rpc) = dial_any(
            &self.endpoints,
            start,
            self.credentials.as_ref(),
            &self.options,
        )
        .await?;

        info!(endpoint = %rpc.endpoint, "reconnected to etcd");
        self.current_endpoint_index.store(index, Ordering::Relaxed);
        *self.rpc.write() = Arc::new(rpc);
        Ok(())
    }

    async fn refresh_token(&self, stale: &Arc<RpcChannel>) -> Result<()> {
        let _guard = self.reconnecting.lock().await;
        if !Arc::ptr_eq(stale, &self.rpc()) {
            return Ok(());
        }
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };
        let rpc = stale.reauthenticated(credentials).await?;
        *self.rpc.write() = Arc::new(rpc);
        Ok(())
    }
}

/// Dial members in order starting at `start`, wrapping around.
///
/// Rejected credentials stop the scan: every member shares the same users.
async fn dial_any(
    endpoints: &[Endpoint],
    start: usize,
    credentials: Option<&Credentials>,
    options: &ConnectOptions,
) -> Result<(usize, RpcChannel)> {
    let mut last_error = None;
    for offset in 0..endpoints.len() {
        let index = (start + offset) % endpoints.len();
        let endpoint = &endpoints[index];
        match RpcChannel::connect(endpoint, credentials, options).await {
            Ok(rpc) => return Ok((index, rpc)),
            Err(e @ SyncError::AuthFailed(_)) => return Err(e),
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "etcd member unreachable");
                last_error = Some(e);
            }
        }
    }
    Err(SyncError::Connection(format!(
        "no reachable etcd member among {} endpoint(s): {}",
        endpoints.len(),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn create_revision_is(key: &[u8], revision: Revision) -> Compare {
    Compare {
        result: CompareResult::Equal as i32,
        target: CompareTarget::Create as i32,
        key: key.to_vec(),
        range_end: Vec::new(),
        target_union: Some(compare::TargetUnion::CreateRevision(revision)),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let req = LeaseGrantRequest { ttl: ttl_secs, id: 0 };
        let resp = self
            .call("lease_grant", |rpc| {
                let req = req.clone();
                async move { rpc.lease_grant(req).await }
            })
            .await?;
        if !resp.error.is_empty() {
            return Err(SyncError::Transport(format!("lease grant: {}", resp.error)));
        }
        Ok(resp.id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<i64> {
        let resp = self
            .call("lease_keep_alive", |rpc| async move {
                rpc.lease_keep_alive_once(lease).await
            })
            .await?;
        if resp.ttl <= 0 {
            return Err(SyncError::LeaseExpired(lease));
        }
        Ok(resp.ttl)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let found = self
            .call("lease_revoke", |rpc| async move {
                match rpc.lease_revoke(LeaseRevokeRequest { id: lease }).await {
                    Ok(_) => Ok(true),
                    Err(status) if status.code() == Code::NotFound => Ok(false),
                    Err(status) => Err(status),
                }
            })
            .await?;
        if found {
            Ok(())
        } else {
            Err(SyncError::LeaseExpired(lease))
        }
    }

    async fn create(&self, key: &str, value: &[u8], lease: LeaseId) -> Result<Option<KeyValue>> {
        let txn = TxnRequest {
            compare: vec![create_revision_is(key.as_bytes(), 0)],
            success: vec![RequestOp {
                request: Some(request_op::Request::RequestPut(PutRequest {
                    key: key.as_bytes().to_vec(),
                    value: value.to_vec(),
                    lease,
                    ..Default::default()
                })),
            }],
            failure: vec![RequestOp {
                request: Some(request_op::Request::RequestRange(RangeRequest {
                    key: key.as_bytes().to_vec(),
                    ..Default::default()
                })),
            }],
        };

        let resp = self
            .call("create", |rpc| {
                let txn = txn.clone();
                async move { rpc.txn(txn).await }
            })
            .await?;

        if resp.succeeded {
            let revision = resp.header.map(|h| h.revision).unwrap_or_default();
            return Ok(Some(KeyValue {
                key: key.to_string(),
                value: value.to_vec(),
                create_revision: revision,
                mod_revision: revision,
                lease,
            }));
        }

        // A retried create may find the key written by its own first attempt.
        let existing = resp.responses.into_iter().find_map(|op| match op.response {
            Some(response_op::Response::ResponseRange(range)) => range.kvs.into_iter().next(),
            _ => None,
        });
        match existing {
            Some(kv) if kv.lease == lease && kv.value == value => Ok(Some(kv.into())),
            _ => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let req = RangeRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        };
        let resp = self
            .call("get", |rpc| {
                let req = req.clone();
                async move { rpc.range(req).await }
            })
            .await?;
        Ok(resp.kvs.into_iter().next().map(Into::into))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let req = RangeRequest {
            key: prefix.as_bytes().to_vec(),
            range_end: prefix_range_end(prefix.as_bytes()),
            sort_order: SortOrder::Ascend as i32,
            sort_target: SortTarget::Create as i32,
            ..Default::default()
        };
        let resp = self
            .call("get_prefix", |rpc| {
                let req = req.clone();
                async move { rpc.range(req).await }
            })
            .await?;
        Ok(resp.kvs.into_iter().map(Into::into).collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let req = DeleteRangeRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        };
        let resp = self
            .call("delete", |rpc| {
                let req = req.clone();
                async move { rpc.delete_range(req).await }
            })
            .await?;
        Ok(resp.deleted > 0)
    }

    async fn delete_if_created(&self, key: &str, create_revision: Revision) -> Result<bool> {
        let txn = TxnRequest {
            compare: vec![create_revision_is(key.as_bytes(), create_revision)],
            success: vec![RequestOp {
                request: Some(request_op::Request::RequestDeleteRange(DeleteRangeRequest {
                    key: key.as_bytes().to_vec(),
                    ..Default::default()
                })),
            }],
            failure: Vec::new(),
        };
        let resp = self
            .call("delete_if_created", |rpc| {
                let txn = txn.clone();
                async move { rpc.txn(txn).await }
            })
            .await?;

        if !resp.succeeded {
            return Ok(false);
        }
        let deleted = resp.responses.into_iter().any(|op| {
            matches!(
                op.response,
                Some(response_op::Response::ResponseDeleteRange(ref d)) if d.deleted > 0
            )
        });
        Ok(deleted)
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let (request_tx, mut inbound) = self
            .call("watch", |rpc| {
                let key = key.to_string();
                async move { rpc.watch(&key).await }
            })
            .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watched = key.to_string();
        tokio::spawn(async move {
            // Dropping the request sender ends the watch server-side.
            let _request_tx = request_tx;
            loop {
                tokio::select! {
                    _ = events_tx.closed() => break,
                    message = inbound.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled {
                                let _ = events_tx.send(Err(SyncError::Transport(format!(
                                    "watch cancelled: {}",
                                    resp.cancel_reason
                                ))));
                                break;
                            }
                            for event in resp.events.into_iter().filter_map(to_watch_event) {
                                if events_tx.send(Ok(event)).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            let _ = events_tx.send(Err(SyncError::Connection(
                                "watch stream closed".to_string(),
                            )));
                            break;
                        }
                        Err(status) => {
                            let _ = events_tx.send(Err(status.into()));
                            break;
                        }
                    }
                }
            }
            debug!(key = %watched, "watch reader stopped");
        });

        Ok(UnboundedReceiverStream::new(events_rx).boxed())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!(endpoint = %self.current_endpoint(), "etcd client closed");
    }
}
