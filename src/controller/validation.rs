//! Spec invariants shared by admission and the reconciler
//!
//! Admission runs these checks before a spec is persisted. The reconciler
//! runs the static subset again; a violation there means admission was
//! bypassed and is treated as fatal.

use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{AgentKind, LifecyclePhase, MongoDB, MongoDBSpec, TlsMode, Topology};
use crate::resources::topology::DATABASE_PORT;

/// Reason codes attached to rejections
pub mod reasons {
    pub const INVALID_VERSION: &str = "InvalidVersion";
    pub const UNSUPPORTED_VERSION: &str = "UnsupportedVersion";
    pub const INVALID_REPLICAS: &str = "InvalidReplicas";
    pub const INVALID_TOPOLOGY: &str = "InvalidTopology";
    pub const INVALID_STORAGE: &str = "InvalidStorage";
    pub const CLUSTER_AUTH_REQUIRES_TLS: &str = "ClusterAuthRequiresTls";
    pub const INCOMPLETE_MONITOR: &str = "IncompleteMonitorSpec";
    pub const INVALID_BACKUP_SCHEDULE: &str = "InvalidBackupSchedule";
    pub const INVALID_INIT_SOURCE: &str = "InvalidInitSource";
    pub const TOPOLOGY_IMMUTABLE: &str = "TopologyImmutable";
    pub const SHARD_TOPOLOGY_IMMUTABLE: &str = "ShardTopologyImmutable";
    pub const STORAGE_IMMUTABLE: &str = "StorageImmutable";
    pub const INIT_IMMUTABLE: &str = "InitImmutable";
}

/// Run every static check on a spec
pub fn validate_spec(spec: &MongoDBSpec, config: &OperatorConfig) -> Result<()> {
    validate_version(spec, config)?;
    validate_topology(spec)?;
    validate_storage(spec)?;
    validate_tls(spec)?;
    validate_monitor(spec)?;
    validate_backup_schedule(spec)?;
    validate_init(spec)?;
    Ok(())
}

pub fn validate_version(spec: &MongoDBSpec, config: &OperatorConfig) -> Result<()> {
    if spec.version.trim().is_empty() {
        return Err(Error::rejected(
            reasons::INVALID_VERSION,
            "spec.version must not be empty",
        ));
    }
    if !config.is_supported_version(&spec.version) {
        return Err(Error::rejected(
            reasons::UNSUPPORTED_VERSION,
            format!(
                "version {} is not supported, expected one of {}",
                spec.version,
                config.supported_versions.join(", ")
            ),
        ));
    }
    Ok(())
}

pub fn validate_topology(spec: &MongoDBSpec) -> Result<()> {
    match &spec.topology {
        Topology::Standalone => {
            if let Some(replicas) = spec.replicas
                && replicas != 1
            {
                return Err(Error::rejected(
                    reasons::INVALID_REPLICAS,
                    format!("standalone databases run exactly 1 replica, got {}", replicas),
                ));
            }
        }
        Topology::ReplicaSet { name } => {
            if name.trim().is_empty() {
                return Err(Error::rejected(
                    reasons::INVALID_TOPOLOGY,
                    "replica set name must not be empty",
                ));
            }
            if spec.replicas.is_some_and(|r| r < 1) {
                return Err(Error::rejected(
                    reasons::INVALID_REPLICAS,
                    "replica set needs at least 1 member",
                ));
            }
        }
        Topology::Sharded(shard) => {
            let counts = [
                ("shards", shard.shards),
                ("shardReplicas", shard.shard_replicas),
                ("configServerReplicas", shard.config_server_replicas),
                ("mongosReplicas", shard.mongos_replicas),
            ];
            if let Some((field, value)) = counts.iter().find(|(_, v)| *v < 1) {
                return Err(Error::rejected(
                    reasons::INVALID_REPLICAS,
                    format!("topology.{} must be at least 1, got {}", field, value),
                ));
            }
            let valid_prefix = !shard.prefix.is_empty()
                && shard
                    .prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !valid_prefix {
                return Err(Error::rejected(
                    reasons::INVALID_TOPOLOGY,
                    format!(
                        "shard prefix {:?} must be non-empty lowercase alphanumeric",
                        shard.prefix
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Validate storage size format (e.g., "10Gi", "512Mi")
pub fn validate_storage(spec: &MongoDBSpec) -> Result<()> {
    let Some(storage) = &spec.storage else {
        return Ok(());
    };
    let size = storage.size.trim();
    let suffix_ok = ["Ki", "Mi", "Gi", "Ti"].iter().any(|s| size.ends_with(s));
    let number = size.trim_end_matches(char::is_alphabetic);
    if !suffix_ok || number.parse::<u64>().map_or(true, |n| n == 0) {
        return Err(Error::rejected(
            reasons::INVALID_STORAGE,
            format!("storage size {:?} must be a positive quantity in Ki, Mi, Gi or Ti", size),
        ));
    }
    Ok(())
}

pub fn validate_tls(spec: &MongoDBSpec) -> Result<()> {
    let tls_mode = spec.tls.as_ref().map(|t| t.mode).unwrap_or(TlsMode::Disabled);
    if spec.cluster_auth_mode.requires_certificates() && tls_mode == TlsMode::Disabled {
        return Err(Error::rejected(
            reasons::CLUSTER_AUTH_REQUIRES_TLS,
            format!(
                "clusterAuthMode {} requires TLS to be enabled",
                spec.cluster_auth_mode.as_str()
            ),
        ));
    }
    Ok(())
}

pub fn validate_monitor(spec: &MongoDBSpec) -> Result<()> {
    let Some(monitor) = &spec.monitor else {
        return Ok(());
    };

    if let Some(port) = monitor.prometheus.as_ref().and_then(|p| p.port)
        && (!(1..=65535).contains(&port) || port == DATABASE_PORT)
    {
        return Err(Error::rejected(
            reasons::INCOMPLETE_MONITOR,
            format!("exporter port {} is not usable", port),
        ));
    }

    if monitor.agent == AgentKind::PrometheusOperator {
        let prometheus = monitor.prometheus.as_ref();
        let complete = prometheus.is_some_and(|p| {
            p.namespace.as_deref().is_some_and(|ns| !ns.is_empty())
                && !p.labels.is_empty()
                && p.interval.as_deref().is_some_and(|i| !i.is_empty())
        });
        if !complete {
            return Err(Error::rejected(
                reasons::INCOMPLETE_MONITOR,
                format!(
                    "agent {} requires prometheus.namespace, prometheus.labels and prometheus.interval",
                    monitor.agent.as_str()
                ),
            ));
        }
    }
    Ok(())
}

pub fn validate_backup_schedule(spec: &MongoDBSpec) -> Result<()> {
    let Some(schedule) = &spec.backup_schedule else {
        return Ok(());
    };
    if schedule.cron_expression.split_whitespace().count() != 5 {
        return Err(Error::rejected(
            reasons::INVALID_BACKUP_SCHEDULE,
            format!(
                "cron expression {:?} must have five fields",
                schedule.cron_expression
            ),
        ));
    }
    if schedule.storage_secret_name.trim().is_empty() {
        return Err(Error::rejected(
            reasons::INVALID_BACKUP_SCHEDULE,
            "backupSchedule.storageSecretName must not be empty",
        ));
    }
    Ok(())
}

pub fn validate_init(spec: &MongoDBSpec) -> Result<()> {
    if let Some(init) = &spec.init
        && init.script_source.is_some()
        && init.snapshot_source.is_some()
    {
        return Err(Error::rejected(
            reasons::INVALID_INIT_SOURCE,
            "declare either init.scriptSource or init.snapshotSource, not both",
        ));
    }
    Ok(())
}

/// Whether child resources were materialized at least once
pub fn is_materialized(mongodb: &MongoDB) -> bool {
    mongodb.status.as_ref().is_some_and(|s| s.materialized)
        || matches!(
            mongodb.phase(),
            LifecyclePhase::Initializing | LifecyclePhase::Running | LifecyclePhase::Failed
        )
}

/// Validate a spec change against the stored object
pub fn validate_spec_change(old: &MongoDB, new: &MongoDB) -> Result<()> {
    let (old_spec, new_spec) = (&old.spec, &new.spec);

    match (&old_spec.topology, &new_spec.topology) {
        (Topology::Sharded(before), Topology::Sharded(after)) => {
            if is_materialized(old) && before != after {
                return Err(Error::rejected(
                    reasons::SHARD_TOPOLOGY_IMMUTABLE,
                    "shard prefix and replica counts cannot change once the cluster is materialized",
                ));
            }
        }
        (Topology::ReplicaSet { name: before }, Topology::ReplicaSet { name: after }) => {
            if before != after {
                return Err(Error::rejected(
                    reasons::TOPOLOGY_IMMUTABLE,
                    format!("replica set name cannot change from {} to {}", before, after),
                ));
            }
        }
        (before, after) if before.mode() != after.mode() => {
            return Err(Error::rejected(
                reasons::TOPOLOGY_IMMUTABLE,
                format!(
                    "topology mode cannot change from {} to {}",
                    before.mode(),
                    after.mode()
                ),
            ));
        }
        _ => {}
    }

    if old_spec.storage != new_spec.storage {
        return Err(Error::rejected(
            reasons::STORAGE_IMMUTABLE,
            "storage cannot be changed after creation",
        ));
    }

    if old.is_initialized() && old_spec.init != new_spec.init {
        return Err(Error::rejected(
            reasons::INIT_IMMUTABLE,
            "spec.init cannot change once initialization was attempted",
        ));
    }

    Ok(())
}
