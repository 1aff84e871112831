//! Operator configuration read from the environment
//!
//! Every setting has a default so the operator starts with no environment at
//! all. Values that are present but unparsable fail startup.

use std::str::FromStr;
use std::time::Duration;

use crate::controller::error::{BackoffConfig, Error, Result};

const PREFIX: &str = "MONGODB_OPERATOR_";

/// Default path for webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path for webhook TLS key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;
/// Default health server port
pub const HEALTH_PORT: u16 = 8080;

/// Name of the shared headless service used for member identity
pub const DEFAULT_GOVERNING_SERVICE: &str = "mongodb-gvr";

/// Server versions accepted at admission
pub const DEFAULT_SUPPORTED_VERSIONS: &[&str] = &["3.4", "3.6", "4.0", "4.2", "4.4"];

/// Container images used for workloads and jobs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageConfig {
    pub registry: String,
    pub mongo: String,
    pub exporter: String,
    pub exporter_tag: String,
    pub tools: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            registry: "docker.io".to_string(),
            mongo: "library/mongo".to_string(),
            exporter: "percona/mongodb_exporter".to_string(),
            exporter_tag: "0.20.0".to_string(),
            tools: "library/mongo".to_string(),
        }
    }
}

impl ImageConfig {
    /// Database server image for a version
    pub fn mongo(&self, version: &str) -> String {
        format!("{}/{}:{}", self.registry, self.mongo, version)
    }

    /// Metrics exporter sidecar image
    pub fn exporter(&self) -> String {
        format!("{}/{}:{}", self.registry, self.exporter, self.exporter_tag)
    }

    /// Image running the restore and backup jobs
    pub fn tools(&self, version: &str) -> String {
        format!("{}/{}:{}", self.registry, self.tools, version)
    }
}

/// Admission webhook server settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookConfig {
    pub cert_path: String,
    pub key_path: String,
    pub port: u16,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            cert_path: WEBHOOK_CERT_PATH.to_string(),
            key_path: WEBHOOK_KEY_PATH.to_string(),
            port: WEBHOOK_PORT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Restrict watches to one namespace; cluster-wide when unset
    pub watch_namespace: Option<String>,
    /// Maximum number of concurrent reconciles per controller
    pub workers: usize,
    /// Consecutive failures after which a resource is marked stalled
    pub max_retries: u32,
    /// Period after which every known resource is enqueued again
    pub resync_period: Duration,
    pub governing_service: String,
    pub images: ImageConfig,
    /// Upper bound for initialization and pod teardown waits
    pub init_timeout: Duration,
    pub poll_interval: Duration,
    pub supported_versions: Vec<String>,
    /// Create a service account, role and binding per workload
    pub enable_rbac: bool,
    /// Force `replicas = 1` for standalone databases at admission
    pub force_standalone_replicas: bool,
    pub webhook: WebhookConfig,
    pub health_port: u16,
    pub backoff: BackoffConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            workers: 2,
            max_retries: 5,
            resync_period: Duration::from_secs(600),
            governing_service: DEFAULT_GOVERNING_SERVICE.to_string(),
            images: ImageConfig::default(),
            init_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
            supported_versions: DEFAULT_SUPPORTED_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            enable_rbac: true,
            force_standalone_replicas: false,
            webhook: WebhookConfig::default(),
            health_port: HEALTH_PORT,
            backoff: BackoffConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Read configuration from `MONGODB_OPERATOR_*` variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(&format!("{}{}", PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let supported_versions = match get("SUPPORTED_VERSIONS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.supported_versions,
        };

        let images = ImageConfig {
            registry: get("REGISTRY").unwrap_or(defaults.images.registry),
            mongo: get("MONGO_IMAGE").unwrap_or(defaults.images.mongo),
            exporter: get("EXPORTER_IMAGE").unwrap_or(defaults.images.exporter),
            exporter_tag: get("EXPORTER_TAG").unwrap_or(defaults.images.exporter_tag),
            tools: get("TOOLS_IMAGE").unwrap_or(defaults.images.tools),
        };

        let webhook = WebhookConfig {
            cert_path: get("WEBHOOK_CERT_PATH").unwrap_or(defaults.webhook.cert_path),
            key_path: get("WEBHOOK_KEY_PATH").unwrap_or(defaults.webhook.key_path),
            port: parse(&get, "WEBHOOK_PORT", defaults.webhook.port)?,
        };

        let config = Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            workers: parse(&get, "WORKERS", defaults.workers)?,
            max_retries: parse(&get, "MAX_RETRIES", defaults.max_retries)?,
            resync_period: Duration::from_secs(parse(
                &get,
                "RESYNC_PERIOD_SECS",
                defaults.resync_period.as_secs(),
            )?),
            governing_service: get("GOVERNING_SERVICE").unwrap_or(defaults.governing_service),
            images,
            init_timeout: Duration::from_secs(parse(
                &get,
                "INIT_TIMEOUT_SECS",
                defaults.init_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_secs(parse(
                &get,
                "POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            supported_versions,
            enable_rbac: parse(&get, "ENABLE_RBAC", defaults.enable_rbac)?,
            force_standalone_replicas: parse(
                &get,
                "FORCE_STANDALONE_REPLICAS",
                defaults.force_standalone_replicas,
            )?,
            webhook,
            health_port: parse(&get, "HEALTH_PORT", defaults.health_port)?,
            backoff: defaults.backoff,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}WORKERS must be at least 1",
                PREFIX
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "{}POLL_INTERVAL_SECS must be at least 1",
                PREFIX
            )));
        }
        if self.supported_versions.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{}SUPPORTED_VERSIONS must list at least one version",
                PREFIX
            )));
        }
        Ok(())
    }

    pub fn is_supported_version(&self, version: &str) -> bool {
        self.supported_versions.iter().any(|v| v == version)
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(raw) => raw.parse().map_err(|e| {
            Error::InvalidConfig(format!("{}{}={:?}: {}", PREFIX, name, raw, e))
        }),
        None => Ok(default),
    }
}
