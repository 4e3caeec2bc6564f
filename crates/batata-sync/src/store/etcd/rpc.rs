//! Raw gRPC calls against one etcd member
//!
//! An [`RpcChannel`] pairs a connected tonic channel with the auth token
//! obtained on it. It performs a single attempt per call; endpoint rotation
//! and token refresh live in [`super::EtcdStore`].

use std::time::Duration;

use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Channel;
use tonic::{Code, Request, Status, Streaming};
use tracing::{debug, warn};

use super::proto::*;
use crate::discovery::Endpoint;
use crate::error::{Result, SyncError};
use crate::store::{ConnectOptions, Credentials};

const KV_RANGE: &str = "/etcdserverpb.KV/Range";
const KV_DELETE_RANGE: &str = "/etcdserverpb.KV/DeleteRange";
const KV_TXN: &str = "/etcdserverpb.KV/Txn";
const WATCH: &str = "/etcdserverpb.Watch/Watch";
const LEASE_GRANT: &str = "/etcdserverpb.Lease/LeaseGrant";
const LEASE_REVOKE: &str = "/etcdserverpb.Lease/LeaseRevoke";
const LEASE_KEEP_ALIVE: &str = "/etcdserverpb.Lease/LeaseKeepAlive";
const AUTH_AUTHENTICATE: &str = "/etcdserverpb.Auth/Authenticate";

/// Metadata key carrying the auth token.
const TOKEN_METADATA_KEY: &str = "token";

/// Connected channel to one member, with its auth token.
pub(crate) struct RpcChannel {
    pub(crate) endpoint: Endpoint,
    channel: Channel,
    token: Option<AsciiMetadataValue>,
    request_timeout: Duration,
}

impl RpcChannel {
    /// Dial `endpoint` and authenticate when credentials are given.
    pub(crate) async fn connect(
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let channel = Channel::from_shared(endpoint.url())
            .map_err(|e| SyncError::Connection(format!("invalid endpoint {}: {}", endpoint, e)))?
            .connect_timeout(options.dial_timeout)
            .tcp_nodelay(true)
            .connect()
            .await
            .map_err(|e| SyncError::Connection(format!("dial {} failed: {}", endpoint, e)))?;

        let mut rpc = Self {
            endpoint: endpoint.clone(),
            channel,
            token: None,
            request_timeout: options.request_timeout,
        };

        if let Some(credentials) = credentials {
            rpc.token = rpc.authenticate(credentials).await?;
        }

        debug!(endpoint = %endpoint, authenticated = rpc.token.is_some(), "connected to etcd member");
        Ok(rpc)
    }

    /// Same channel with a freshly issued token.
    pub(crate) async fn reauthenticated(&self, credentials: &Credentials) -> Result<Self> {
        let token = self.authenticate(credentials).await?;
        Ok(Self {
            endpoint: self.endpoint.clone(),
            channel: self.channel.clone(),
            token,
            request_timeout: self.request_timeout,
        })
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Option<AsciiMetadataValue>> {
        let req = AuthenticateRequest {
            name: credentials.username.clone(),
            password: credentials.password.clone(),
        };

        match self
            .unary::<_, AuthenticateResponse>(AUTH_AUTHENTICATE, self.request(req, false))
            .await
        {
            Ok(resp) => {
                let token = AsciiMetadataValue::try_from(resp.token.as_str())
                    .map_err(|e| SyncError::AuthFailed(format!("malformed token: {}", e)))?;
                Ok(Some(token))
            }
            Err(status)
                if status.code() == Code::FailedPrecondition
                    && status.message().contains("authentication is not enabled") =>
            {
                warn!(endpoint = %self.endpoint, "credentials configured but store auth is disabled");
                Ok(None)
            }
            Err(status) if status.code() == Code::InvalidArgument => {
                Err(SyncError::AuthFailed(status.message().to_string()))
            }
            Err(status) => Err(status.into()),
        }
    }

    fn request<T>(&self, message: T, with_token: bool) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.request_timeout);
        if with_token && let Some(token) = &self.token {
            request.metadata_mut().insert(TOKEN_METADATA_KEY, token.clone());
        }
        request
    }

    fn stream_request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(token) = &self.token {
            request.metadata_mut().insert(TOKEN_METADATA_KEY, token.clone());
        }
        request
    }

    async fn unary<Req, Resp>(
        &self,
        path: &'static str,
        request: Request<Req>,
    ) -> std::result::Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {}", e)))?;
        let codec = tonic_prost::ProstCodec::default();
        let response = grpc
            .unary(request, PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    async fn streaming<Req, Resp>(
        &self,
        path: &'static str,
        outbound: mpsc::Receiver<Req>,
    ) -> std::result::Result<Streaming<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {}", e)))?;
        let codec = tonic_prost::ProstCodec::default();
        let request = self.stream_request(ReceiverStream::new(outbound));
        let response = grpc
            .streaming(request, PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    pub(crate) async fn range(&self, req: RangeRequest) -> std::result::Result<RangeResponse, Status> {
        self.unary(KV_RANGE, self.request(req, true)).await
    }

    pub(crate) async fn delete_range(
        &self,
        req: DeleteRangeRequest,
    ) -> std::result::Result<DeleteRangeResponse, Status> {
        self.unary(KV_DELETE_RANGE, self.request(req, true)).await
    }

    pub(crate) async fn txn(&self, req: TxnRequest) -> std::result::Result<TxnResponse, Status> {
        self.unary(KV_TXN, self.request(req, true)).await
    }

    pub(crate) async fn lease_grant(
        &self,
        req: LeaseGrantRequest,
    ) -> std::result::Result<LeaseGrantResponse, Status> {
        self.unary(LEASE_GRANT, self.request(req, true)).await
    }

    pub(crate) async fn lease_revoke(
        &self,
        req: LeaseRevokeRequest,
    ) -> std::result::Result<LeaseRevokeResponse, Status> {
        self.unary(LEASE_REVOKE, self.request(req, true)).await
    }

    /// One keep-alive round trip on a short-lived stream.
    pub(crate) async fn lease_keep_alive_once(
        &self,
        id: i64,
    ) -> std::result::Result<LeaseKeepAliveResponse, Status> {
        let (tx, rx) = mpsc::channel(1);
        tx.send(LeaseKeepAliveRequest { id })
            .await
            .map_err(|_| Status::internal("keep-alive request channel closed"))?;

        let exchange = async {
            let mut inbound: Streaming<LeaseKeepAliveResponse> =
                self.streaming(LEASE_KEEP_ALIVE, rx).await?;
            inbound
                .message()
                .await?
                .ok_or_else(|| Status::unavailable("keep-alive stream closed"))
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| Status::deadline_exceeded("keep-alive timed out"))?
    }

    /// Open a watch on `key` and wait until the server confirms it.
    ///
    /// The returned sender must be kept alive for as long as the watch is
    /// read.
    pub(crate) async fn watch(
        &self,
        key: &str,
    ) -> std::result::Result<(mpsc::Sender<WatchRequest>, Streaming<WatchResponse>), Status> {
        let (tx, rx) = mpsc::channel(4);
        let create = WatchRequest {
            request_union: Some(watch_request::RequestUnion::CreateRequest(
                WatchCreateRequest {
                    key: key.as_bytes().to_vec(),
                    ..Default::default()
                },
            )),
        };
        tx.send(create)
            .await
            .map_err(|_| Status::internal("watch request channel closed"))?;

        let establish = async {
            let mut inbound: Streaming<WatchResponse> = self.streaming(WATCH, rx).await?;
            loop {
                let resp = inbound
                    .message()
                    .await?
                    .ok_or_else(|| Status::unavailable("watch stream closed"))?;
                if resp.canceled {
                    return Err(Status::failed_precondition(format!(
                        "watch rejected: {}",
                        resp.cancel_reason
                    )));
                }
                if resp.created {
                    return Ok(inbound);
                }
            }
        };

        let inbound = tokio::time::timeout(self.request_timeout, establish)
            .await
            .map_err(|_| Status::deadline_exceeded("watch creation timed out"))??;
        Ok((tx, inbound))
    }
}
