//! Discovery of the coordination cluster's endpoints
//!
//! A [`Resolver`] maps a logical service name to the `host:port` addresses
//! of the coordination store. An unregistered name resolves to an empty
//! list; turning that into an error is the caller's decision.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Default client port of the coordination store.
pub const DEFAULT_STORE_PORT: u16 = 2379;

/// Address of one coordination store member.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// URL form used by HTTP/2 transports (`http://host:port`).
    pub fn url(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("http://{}", self.address)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl From<&str> for Endpoint {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for Endpoint {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

/// Maps a service name to coordination store endpoints.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Resolve `service_name`. Unknown names yield `Ok(vec![])`.
    async fn resolve(&self, service_name: &str) -> Result<Vec<Endpoint>>;
}

/// Shuffle endpoints so clients spread over the cluster members.
pub fn shuffle_endpoints(endpoints: &mut [Endpoint]) {
    endpoints.shuffle(&mut rand::rng());
}

// ============================================================================
// StaticRegistry
// ============================================================================

/// In-process registry of service endpoints.
///
/// Either a per-service table, or a fixed endpoint list returned for every
/// name (see [`StaticRegistry::fixed`]).
#[derive(Default)]
pub struct StaticRegistry {
    services: RwLock<HashMap<String, Vec<Endpoint>>>,
    fixed: Option<Vec<Endpoint>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that answers every service name with `endpoints`.
    pub fn fixed<I, E>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        Self {
            services: RwLock::new(HashMap::new()),
            fixed: Some(endpoints.into_iter().map(Into::into).collect()),
        }
    }

    /// Builder form of [`StaticRegistry::register`].
    pub fn with_service<I, E>(self, service_name: &str, endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        for endpoint in endpoints {
            self.register(service_name, endpoint);
        }
        self
    }

    pub fn register(&self, service_name: &str, endpoint: impl Into<Endpoint>) {
        let endpoint = endpoint.into();
        let mut services = self.services.write();
        let entry = services.entry(service_name.to_string()).or_default();
        if !entry.contains(&endpoint) {
            entry.push(endpoint);
        }
    }

    /// Remove a service; returns whether it was registered.
    pub fn deregister(&self, service_name: &str) -> bool {
        self.services.write().remove(service_name).is_some()
    }
}

#[async_trait]
impl Resolver for StaticRegistry {
    async fn resolve(&self, service_name: &str) -> Result<Vec<Endpoint>> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }
        Ok(self
            .services
            .read()
            .get(service_name)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// DnsResolver
// ============================================================================

/// Resolves the service name as a DNS host, `host` or `host:port`.
///
/// Lookup failures (NXDOMAIN and friends) count as "not registered".
pub struct DnsResolver {
    default_port: u16,
}

impl DnsResolver {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }

    fn target(&self, service_name: &str) -> String {
        match service_name.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => service_name.to_string(),
            _ => format!("{}:{}", service_name, self.default_port),
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_PORT)
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, service_name: &str) -> Result<Vec<Endpoint>> {
        if service_name.is_empty() {
            return Ok(Vec::new());
        }

        let target = self.target(service_name);
        match tokio::net::lookup_host(target.as_str()).await {
            Ok(addrs) => {
                let mut endpoints: Vec<Endpoint> =
                    addrs.map(|addr| Endpoint::new(addr.to_string())).collect();
                endpoints.dedup();
                Ok(endpoints)
            }
            Err(e) => {
                debug!(service = %service_name, error = %e, "DNS lookup found no endpoints");
                Ok(Vec::new())
            }
        }
    }
}

// ============================================================================
// NacosRegistry
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<InstanceHost>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceHost {
    ip: String,
    port: u16,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Resolves services through a Nacos-compatible naming server.
///
/// Only healthy, enabled instances are returned.
pub struct NacosRegistry {
    http_client: Client,
    server_addr: String,
    namespace: String,
    group_name: String,
}

impl NacosRegistry {
    /// `server_addr` is the base HTTP address, e.g. `http://127.0.0.1:8848`.
    pub fn new(server_addr: &str) -> Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;

        let server_addr = if server_addr.starts_with("http") {
            server_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server_addr.trim_end_matches('/'))
        };

        Ok(Self {
            http_client,
            server_addr,
            namespace: String::new(),
            group_name: "DEFAULT_GROUP".to_string(),
        })
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_group(mut self, group_name: &str) -> Self {
        self.group_name = group_name.to_string();
        self
    }
}

/// Parse an instance list body into endpoints.
fn parse_instance_list(body: &str) -> Result<Vec<Endpoint>> {
    let list: InstanceList = serde_json::from_str(body)
        .map_err(|e| SyncError::Transport(format!("invalid instance list: {}", e)))?;

    Ok(list
        .hosts
        .into_iter()
        .filter(|host| host.healthy && host.enabled)
        .map(|host| Endpoint::new(format!("{}:{}", host.ip, host.port)))
        .collect())
}

#[async_trait]
impl Resolver for NacosRegistry {
    async fn resolve(&self, service_name: &str) -> Result<Vec<Endpoint>> {
        let url = format!("{}/nacos/v1/ns/instance/list", self.server_addr);

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("serviceName", service_name),
                ("groupName", self.group_name.as_str()),
                ("namespaceId", self.namespace.as_str()),
                ("healthyOnly", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::NOT_FOUND || body.contains("not found") {
            debug!(service = %service_name, "service is not registered");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(SyncError::Transport(format!(
                "instance list failed with status {}: {}",
                status, body
            )));
        }

        parse_instance_list(&body)
    }
}
