//! Construction options for [`crate::Sync`]

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File};
use tracing::warn;
use uuid::Uuid;

use crate::discovery::{Endpoint, Resolver, StaticRegistry};
use crate::error::{Result, SyncError};
use crate::store::etcd::EtcdConnector;
use crate::store::{ConnectOptions, Connector, Credentials};

/// Default session lease TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable prefix, e.g. `BATATA_SYNC__TTL=15`.
pub const ENV_PREFIX: &str = "BATATA";

/// Options for [`crate::Sync::new`].
///
/// ```no_run
/// use std::time::Duration;
/// use batata_sync::SyncOptions;
///
/// let options = SyncOptions::new()
///     .with_endpoints(["10.0.0.1:2379", "10.0.0.2:2379"])
///     .with_auth("root", "secret")
///     .with_ttl(15)
///     .with_heartbeat_interval(Duration::from_secs(5));
/// ```
#[derive(Clone)]
pub struct SyncOptions {
    /// Resolver overriding DNS discovery of the store.
    pub(crate) registry: Option<Arc<dyn Resolver>>,
    pub(crate) credentials: Option<Credentials>,
    /// `None` means a third of the TTL.
    pub(crate) heartbeat_interval: Option<Duration>,
    pub(crate) ttl: Duration,
    pub(crate) dial_timeout: Duration,
    pub(crate) request_timeout: Duration,
    /// Value written into candidate keys.
    pub(crate) candidate_id: String,
    pub(crate) connector: Arc<dyn Connector>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            registry: None,
            credentials: None,
            heartbeat_interval: None,
            ttl: DEFAULT_TTL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            candidate_id: default_candidate_id(),
            connector: Arc::new(EtcdConnector),
        }
    }
}

fn default_candidate_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &nonce[..8])
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the store through `registry` instead of DNS.
    pub fn with_registry(mut self, registry: Arc<dyn Resolver>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a fixed endpoint list regardless of the service name.
    pub fn with_endpoints<I, E>(self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        self.with_registry(Arc::new(StaticRegistry::fixed(endpoints)))
    }

    /// Set authentication credentials
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Session lease TTL in seconds.
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = Duration::from_secs(ttl_secs);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_candidate_id(mut self, candidate_id: &str) -> Self {
        self.candidate_id = candidate_id.to_string();
        self
    }

    /// Replace the etcd connector, e.g. with [`crate::MemoryCluster::connector`].
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Heartbeat interval in effect: the configured one if it is shorter
    /// than the TTL, otherwise a third of the TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        match self.heartbeat_interval {
            Some(interval) if !interval.is_zero() && interval < self.ttl => interval,
            _ => self.ttl / 3,
        }
    }

    pub(crate) fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            dial_timeout: self.dial_timeout,
            request_timeout: self.request_timeout,
        }
    }

    /// Check the options before connecting.
    pub fn validate(&self) -> Result<()> {
        if self.ttl < Duration::from_secs(1) {
            return Err(SyncError::InvalidConfig(
                "ttl must be at least 1 second".to_string(),
            ));
        }
        if let Some(credentials) = &self.credentials
            && (credentials.username.is_empty() || credentials.password.is_empty())
        {
            return Err(SyncError::InvalidConfig(
                "username and password must both be set".to_string(),
            ));
        }
        if self.dial_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(SyncError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.candidate_id.is_empty() {
            return Err(SyncError::InvalidConfig(
                "candidate id must not be empty".to_string(),
            ));
        }
        if let Some(interval) = self.heartbeat_interval
            && (interval.is_zero() || interval >= self.ttl)
        {
            warn!(
                heartbeat_ms = interval.as_millis() as u64,
                ttl_secs = self.ttl.as_secs(),
                "heartbeat interval cannot keep the lease alive, using a third of the ttl"
            );
        }
        Ok(())
    }

    /// Read options from the `sync.*` keys of `config`.
    ///
    /// Recognized keys: `ttl`, `heartbeat_interval_ms`, `dial_timeout_ms`,
    /// `request_timeout_ms`, `username`, `password`, `endpoints` (list or
    /// comma separated) and `candidate_id`. Missing keys keep their defaults.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut options = Self::default();

        if let Ok(ttl) = config.get_int("sync.ttl") {
            options.ttl = Duration::from_secs(non_negative("sync.ttl", ttl)?);
        }
        if let Ok(ms) = config.get_int("sync.heartbeat_interval_ms") {
            options.heartbeat_interval = Some(Duration::from_millis(non_negative(
                "sync.heartbeat_interval_ms",
                ms,
            )?));
        }
        if let Ok(ms) = config.get_int("sync.dial_timeout_ms") {
            options.dial_timeout = Duration::from_millis(non_negative("sync.dial_timeout_ms", ms)?);
        }
        if let Ok(ms) = config.get_int("sync.request_timeout_ms") {
            options.request_timeout =
                Duration::from_millis(non_negative("sync.request_timeout_ms", ms)?);
        }

        match (
            config.get_string("sync.username"),
            config.get_string("sync.password"),
        ) {
            (Ok(username), Ok(password)) => {
                options.credentials = Some(Credentials::new(&username, &password));
            }
            (Ok(_), Err(_)) | (Err(_), Ok(_)) => {
                return Err(SyncError::InvalidConfig(
                    "sync.username and sync.password must be set together".to_string(),
                ));
            }
            _ => {}
        }

        let endpoints = config_endpoints(config);
        if !endpoints.is_empty() {
            options = options.with_endpoints(endpoints);
        }

        if let Ok(candidate_id) = config.get_string("sync.candidate_id") {
            options.candidate_id = candidate_id;
        }

        Ok(options)
    }

    /// Layer an optional config file under `BATATA_*` environment variables
    /// and read the result with [`SyncOptions::from_config`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_config(&config)
    }
}

fn non_negative(key: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| SyncError::InvalidConfig(format!("{} must not be negative", key)))
}

fn config_endpoints(config: &Config) -> Vec<Endpoint> {
    if let Ok(values) = config.get_array("sync.endpoints") {
        return values
            .into_iter()
            .filter_map(|value| value.into_string().ok())
            .map(Endpoint::new)
            .collect();
    }
    config
        .get_string("sync.endpoints")
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Endpoint::from)
                .collect()
        })
        .unwrap_or_default()
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("registry", &self.registry.as_ref().map(|_| "custom"))
            .field("credentials", &self.credentials)
            .field("heartbeat_interval", &self.heartbeat_interval())
            .field("ttl", &self.ttl)
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("candidate_id", &self.candidate_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let options = SyncOptions::new();
        assert_eq!(options.ttl(), Duration::from_secs(10));
        assert_eq!(options.heartbeat_interval(), Duration::from_secs(10) / 3);
        assert!(options.credentials().is_none());
        assert!(!options.candidate_id().is_empty());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_not_below_ttl_is_clamped() {
        let options = SyncOptions::new()
            .with_ttl(6)
            .with_heartbeat_interval(Duration::from_secs(6));
        assert!(options.validate().is_ok());
        assert_eq!(options.heartbeat_interval(), Duration::from_secs(2));

        let options = SyncOptions::new()
            .with_ttl(6)
            .with_heartbeat_interval(Duration::from_millis(500));
        assert_eq!(options.heartbeat_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(matches!(
            SyncOptions::new().with_ttl(0).validate(),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(matches!(
            SyncOptions::new().with_auth("root", "").validate(),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(matches!(
            SyncOptions::new()
                .with_request_timeout(Duration::ZERO)
                .validate(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_debug_hides_password() {
        let options = SyncOptions::new().with_auth("root", "secret");
        let debug = format!("{:?}", options);
        assert!(debug.contains("root"));
        assert!(!debug.contains("secret"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[sync]
ttl = 15
heartbeat_interval_ms = 2000
username = "root"
password = "secret"
endpoints = ["10.0.0.1:2379", "10.0.0.2:2379"]
candidate_id = "node-a"
"#
        )
        .unwrap();

        let options = SyncOptions::load(Some(file.path())).unwrap();
        assert_eq!(options.ttl(), Duration::from_secs(15));
        assert_eq!(options.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(options.candidate_id(), "node-a");
        assert_eq!(options.credentials().unwrap().username, "root");

        let endpoints = options.registry.unwrap().resolve("any").await.unwrap();
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn test_from_config_comma_separated_endpoints() {
        let config = Config::builder()
            .set_override("sync.endpoints", "10.0.0.1:2379, 10.0.0.2:2379,")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config_endpoints(&config).len(), 2);
    }

    #[test]
    fn test_from_config_rejects_half_credentials() {
        let config = Config::builder()
            .set_override("sync.username", "root")
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(
            SyncOptions::from_config(&config),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_config_rejects_negative_ttl() {
        let config = Config::builder()
            .set_override("sync.ttl", -3)
            .unwrap()
            .build()
            .unwrap();
        assert!(SyncOptions::from_config(&config).is_err());
    }
}
