use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by every custom resource of the operator
pub const GROUP: &str = "mongodb-operator.smoketurner.com";

/// Served version of the custom resources
pub const VERSION: &str = "v1alpha1";

/// Label carrying the kind of the database a child object belongs to
pub const LABEL_KIND: &str = "mongodb-operator.smoketurner.com/kind";

/// Label carrying the name of the database a child object belongs to
pub const LABEL_NAME: &str = "mongodb-operator.smoketurner.com/name";

/// Presence-only marker recording that initialization was attempted.
///
/// The value is always empty: the annotation says nothing about whether the
/// attempt succeeded, only that it must not run again.
pub const INITIALIZED_ANNOTATION: &str = "mongodb-operator.smoketurner.com/initialized";

/// Default Prometheus exporter port
pub const DEFAULT_EXPORTER_PORT: i32 = 56790;

/// Default shard name prefix
pub const DEFAULT_SHARD_PREFIX: &str = "shard";

/// MongoDB is the Schema for the mongodbs API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "mongodb-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "MongoDB",
    plural = "mongodbs",
    shortname = "mg",
    namespaced,
    status = "MongoDBStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.topology.mode"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBSpec {
    /// MongoDB server version (e.g., "4.2")
    pub version: String,

    /// Number of members for standalone and replica set topologies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Deployment topology
    #[serde(default)]
    pub topology: Topology,

    /// Persistent storage; absent means ephemeral (emptyDir) data volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Secret holding the root credentials, created lazily when missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,

    /// Authentication mode between cluster members
    #[serde(default)]
    pub cluster_auth_mode: ClusterAuthMode,

    /// Monitoring agent configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSpec>,

    /// What happens to data and credentials when the resource is deleted
    #[serde(default)]
    pub termination_policy: TerminationPolicy,

    /// One-time initialization source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,

    /// Periodic backup schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<BackupScheduleSpec>,

    /// Resource requirements for database containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Topology selector: exactly one of standalone, replica set or sharded cluster
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(tag = "mode")]
pub enum Topology {
    #[default]
    Standalone,
    ReplicaSet {
        /// Replica set name passed to `--replSet`
        name: String,
    },
    Sharded(ShardTopology),
}

impl Topology {
    /// Short name of the topology mode
    pub fn mode(&self) -> &'static str {
        match self {
            Topology::Standalone => "Standalone",
            Topology::ReplicaSet { .. } => "ReplicaSet",
            Topology::Sharded(_) => "Sharded",
        }
    }

    /// Whether the topology runs replicated members
    pub fn is_clustered(&self) -> bool {
        !matches!(self, Topology::Standalone)
    }
}

/// Sharded cluster layout
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShardTopology {
    /// Number of shards
    pub shards: i32,

    /// Members per shard replica set
    pub shard_replicas: i32,

    /// Members of the config server replica set
    pub config_server_replicas: i32,

    /// Number of mongos routers
    pub mongos_replicas: i32,

    /// Prefix used to name shards
    #[serde(default = "default_shard_prefix")]
    pub prefix: String,
}

fn default_shard_prefix() -> String {
    DEFAULT_SHARD_PREFIX.to_string()
}

/// Storage configuration for database data volumes
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the persistent volume (e.g., "10Gi")
    pub size: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default)]
    pub mode: TlsMode,
}

/// TLS mode of the database servers
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, Default)]
pub enum TlsMode {
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "allowSSL")]
    AllowSsl,
    #[serde(rename = "preferSSL")]
    PreferSsl,
    #[default]
    #[serde(rename = "requireSSL")]
    RequireSsl,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Disabled => "disabled",
            TlsMode::AllowSsl => "allowSSL",
            TlsMode::PreferSsl => "preferSSL",
            TlsMode::RequireSsl => "requireSSL",
        }
    }
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication mode used between cluster members
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, Default)]
pub enum ClusterAuthMode {
    #[default]
    #[serde(rename = "keyFile")]
    KeyFile,
    #[serde(rename = "sendKeyFile")]
    SendKeyFile,
    #[serde(rename = "sendX509")]
    SendX509,
    #[serde(rename = "x509")]
    X509,
}

impl ClusterAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterAuthMode::KeyFile => "keyFile",
            ClusterAuthMode::SendKeyFile => "sendKeyFile",
            ClusterAuthMode::SendX509 => "sendX509",
            ClusterAuthMode::X509 => "x509",
        }
    }

    /// Whether members authenticate with certificates
    pub fn requires_certificates(&self) -> bool {
        matches!(self, ClusterAuthMode::SendX509 | ClusterAuthMode::X509)
    }

    /// Whether members need the shared key file
    pub fn uses_key_file(&self) -> bool {
        matches!(
            self,
            ClusterAuthMode::KeyFile | ClusterAuthMode::SendKeyFile | ClusterAuthMode::SendX509
        )
    }
}

/// Monitoring configuration as declared on the resource
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    pub agent: AgentKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusSpec>,
}

/// Monitoring agent flavour
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum AgentKind {
    /// Prometheus scrapes the exporter through service annotations
    #[serde(rename = "prometheus.io/builtin")]
    PrometheusBuiltin,
    /// A ServiceMonitor managed by the Prometheus operator scrapes the exporter
    #[serde(rename = "prometheus.io/operator")]
    PrometheusOperator,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::PrometheusBuiltin => "prometheus.io/builtin",
            AgentKind::PrometheusOperator => "prometheus.io/operator",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    /// Exporter port, defaulted at admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Namespace of the ServiceMonitor (operator agent only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Labels selecting the Prometheus instance (operator agent only)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Scrape interval (operator agent only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// Monitoring capability resolved once per reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorAgent {
    Prometheus { agent: AgentKind, port: i32 },
    None,
}

impl MonitorAgent {
    /// Exporter port when monitoring is enabled
    pub fn exporter_port(&self) -> Option<i32> {
        match self {
            MonitorAgent::Prometheus { port, .. } => Some(*port),
            MonitorAgent::None => None,
        }
    }
}

/// Deletion behaviour
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, Default)]
pub enum TerminationPolicy {
    /// Deletion is rejected at admission
    DoNotTerminate,
    /// Workloads are removed and a dormant record keeps the origin spec
    #[default]
    Pause,
    /// Workloads are removed, volumes and secrets are kept, no dormant record
    Halt,
    /// Workloads, volumes and exclusively referenced secrets are removed
    WipeOut,
}

impl std::fmt::Display for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationPolicy::DoNotTerminate => write!(f, "DoNotTerminate"),
            TerminationPolicy::Pause => write!(f, "Pause"),
            TerminationPolicy::Halt => write!(f, "Halt"),
            TerminationPolicy::WipeOut => write!(f, "WipeOut"),
        }
    }
}

/// One-time initialization source
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    /// Scripts mounted into the database container on first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_source: Option<ScriptSource>,

    /// Snapshot restored by a batch job before the database runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_source: Option<SnapshotSource>,
}

impl InitSpec {
    /// Whether any source is declared
    pub fn is_declared(&self) -> bool {
        self.script_source.is_some() || self.snapshot_source.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSource {
    /// ConfigMap holding the init scripts
    pub config_map: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    /// Snapshot name
    pub name: String,

    /// Namespace of the snapshot (defaults to the database namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Periodic backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Cron expression with five fields
    pub cron_expression: String,

    /// Secret holding the storage backend credentials
    pub storage_secret_name: String,

    /// Destination bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

/// Resource requirements for database pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Status of the MongoDB resource
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: LifecyclePhase,

    /// Time the operator first observed the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    /// Generation of the spec last reconciled successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Set once every child resource was written; shard layout is fixed from then on
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub materialized: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Database lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// Not yet observed by the operator
    #[default]
    Pending,
    /// Child resources are being materialized
    Creating,
    /// The initialization source is being applied
    Initializing,
    /// The database is materialized and serving
    Running,
    /// Workloads are being torn down
    Pausing,
    /// Workloads are gone, a dormant record holds the origin spec
    Paused,
    /// Workloads are gone, volumes and secrets are kept
    Halted,
    /// Data and exclusively referenced secrets are destroyed
    WipedOut,
    /// Initialization failed or timed out
    Failed,
}

impl LifecyclePhase {
    pub const ALL: [LifecyclePhase; 9] = [
        LifecyclePhase::Pending,
        LifecyclePhase::Creating,
        LifecyclePhase::Initializing,
        LifecyclePhase::Running,
        LifecyclePhase::Pausing,
        LifecyclePhase::Paused,
        LifecyclePhase::Halted,
        LifecyclePhase::WipedOut,
        LifecyclePhase::Failed,
    ];

    /// Phases that no event can leave
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecyclePhase::WipedOut)
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecyclePhase::Pending => write!(f, "Pending"),
            LifecyclePhase::Creating => write!(f, "Creating"),
            LifecyclePhase::Initializing => write!(f, "Initializing"),
            LifecyclePhase::Running => write!(f, "Running"),
            LifecyclePhase::Pausing => write!(f, "Pausing"),
            LifecyclePhase::Paused => write!(f, "Paused"),
            LifecyclePhase::Halted => write!(f, "Halted"),
            LifecyclePhase::WipedOut => write!(f, "WipedOut"),
            LifecyclePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MongoDB {
    /// Current phase, `Pending` when no status was written yet
    pub fn phase(&self) -> LifecyclePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Member count for standalone and replica set topologies
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    /// Name of the credentials secret, explicit or defaulted
    pub fn auth_secret_name(&self) -> String {
        self.spec
            .auth_secret
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| default_auth_secret_name(&self.name_any()))
    }

    /// Whether the resource carries the initialization marker
    pub fn is_initialized(&self) -> bool {
        self.annotations().contains_key(INITIALIZED_ANNOTATION)
    }

    /// Whether an initialization source is declared and was never attempted
    pub fn init_pending(&self) -> bool {
        self.spec.init.as_ref().is_some_and(InitSpec::is_declared) && !self.is_initialized()
    }

    /// Effective TLS mode, `Disabled` when no TLS block is present
    pub fn tls_mode(&self) -> TlsMode {
        self.spec
            .tls
            .as_ref()
            .map(|t| t.mode)
            .unwrap_or(TlsMode::Disabled)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_mode() != TlsMode::Disabled
    }

    /// Resolve the monitoring capability for this reconcile
    pub fn monitor_agent(&self) -> MonitorAgent {
        match &self.spec.monitor {
            Some(monitor) => MonitorAgent::Prometheus {
                agent: monitor.agent,
                port: monitor
                    .prometheus
                    .as_ref()
                    .and_then(|p| p.port)
                    .unwrap_or(DEFAULT_EXPORTER_PORT),
            },
            None => MonitorAgent::None,
        }
    }
}

/// Default credentials secret name for a database
pub fn default_auth_secret_name(name: &str) -> String {
    format!("{}-auth", name)
}
