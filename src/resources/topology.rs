//! Role expansion and materialization of a database topology
//!
//! Every name is derived from the database name and the role, so wiring
//! between roles (the mongos connection strings) never needs a live lookup
//! and the order in which roles are materialized does not matter.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{MongoDB, Topology};
use crate::resources::{certificate, monitor, rbac, secret, service, workload};
use crate::store::{Lookup, Verb, create_or_patch};

/// Port every mongod and mongos listens on
pub const DATABASE_PORT: i32 = 27017;

/// Replica set name of the config servers
pub const CONFIG_SERVER_REPL_SET: &str = "cnfRepSet";

/// Functional unit within a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Standalone,
    ReplicaSet,
    Shard(i32),
    ConfigServer,
    Mongos,
}

impl RoleKind {
    /// Value of the role label
    pub fn label(&self) -> &'static str {
        match self {
            RoleKind::Standalone => "standalone",
            RoleKind::ReplicaSet => "replicaset",
            RoleKind::Shard(_) => "shard",
            RoleKind::ConfigServer => "configsvr",
            RoleKind::Mongos => "mongos",
        }
    }
}

/// One workload to materialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePlan {
    pub kind: RoleKind,
    /// Workload name, also used for RBAC objects and the server certificate
    pub workload: String,
    pub replicas: i32,
    /// Replica set the members join, if any
    pub repl_set: Option<String>,
}

impl RolePlan {
    /// Whether the role runs as a StatefulSet with data volumes
    pub fn is_stateful(&self) -> bool {
        self.kind != RoleKind::Mongos
    }

    /// Pod label value distinguishing this role from others of the same kind
    pub fn selector_role(&self) -> String {
        match self.kind {
            RoleKind::Shard(index) => format!("{}-{}", self.kind.label(), index),
            _ => self.kind.label().to_string(),
        }
    }
}

pub fn shard_workload_name(name: &str, prefix: &str, index: i32) -> String {
    format!("{}-{}{}", name, prefix, index)
}

pub fn shard_repl_set_name(prefix: &str, index: i32) -> String {
    format!("{}{}", prefix, index)
}

pub fn config_server_name(name: &str) -> String {
    format!("{}-configsvr", name)
}

pub fn mongos_name(name: &str) -> String {
    format!("{}-mongos", name)
}

/// Expand a spec into its roles
pub fn plan_roles(mongodb: &MongoDB) -> Vec<RolePlan> {
    let name = mongodb.name_any();
    match &mongodb.spec.topology {
        Topology::Standalone => vec![RolePlan {
            kind: RoleKind::Standalone,
            workload: name,
            replicas: 1,
            repl_set: None,
        }],
        Topology::ReplicaSet { name: repl_set } => vec![RolePlan {
            kind: RoleKind::ReplicaSet,
            workload: name,
            replicas: mongodb.replicas(),
            repl_set: Some(repl_set.clone()),
        }],
        Topology::Sharded(shard) => {
            let mut roles: Vec<RolePlan> = (0..shard.shards)
                .map(|index| RolePlan {
                    kind: RoleKind::Shard(index),
                    workload: shard_workload_name(&name, &shard.prefix, index),
                    replicas: shard.shard_replicas,
                    repl_set: Some(shard_repl_set_name(&shard.prefix, index)),
                })
                .collect();
            roles.push(RolePlan {
                kind: RoleKind::ConfigServer,
                workload: config_server_name(&name),
                replicas: shard.config_server_replicas,
                repl_set: Some(CONFIG_SERVER_REPL_SET.to_string()),
            });
            roles.push(RolePlan {
                kind: RoleKind::Mongos,
                workload: mongos_name(&name),
                replicas: shard.mongos_replicas,
                repl_set: None,
            });
            roles
        }
    }
}

/// Role the data service routes clients to
pub fn entry_role(roles: &[RolePlan]) -> Option<&RolePlan> {
    roles
        .iter()
        .find(|r| r.kind == RoleKind::Mongos)
        .or_else(|| roles.first())
}

/// Stable DNS name of a StatefulSet member
pub fn pod_host(pod: &str, governing: &str, namespace: &str) -> String {
    format!("{}.{}.{}.svc", pod, governing, namespace)
}

/// Connection string of a replicated role: `<rs>/<pod-0>:27017,<pod-1>:27017,...`
pub fn repl_set_dsn(role: &RolePlan, governing: &str, namespace: &str) -> Option<String> {
    let repl_set = role.repl_set.as_ref()?;
    let members = (0..role.replicas)
        .map(|i| {
            format!(
                "{}:{}",
                pod_host(&format!("{}-{}", role.workload, i), governing, namespace),
                DATABASE_PORT
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    Some(format!("{}/{}", repl_set, members))
}

/// Tally of what a materialization pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub created: u32,
    pub patched: u32,
    pub unchanged: u32,
}

impl MaterializeReport {
    pub fn record(&mut self, verb: Verb) {
        match verb {
            Verb::Created => self.created += 1,
            Verb::Patched => self.patched += 1,
            Verb::Unchanged => self.unchanged += 1,
        }
    }

    /// Whether any object was written
    pub fn changed(&self) -> bool {
        self.created > 0 || self.patched > 0
    }
}

/// Ensure every child object of a validated spec.
///
/// With TLS enabled the certificate secrets are checked first and nothing is
/// written while any of them is missing.
pub async fn materialize(ctx: &Context, mongodb: &MongoDB) -> Result<MaterializeReport> {
    let namespace = mongodb
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let roles = plan_roles(mongodb);
    let store = &ctx.store;
    let config = &ctx.config;

    if mongodb.tls_enabled() {
        certificate::check_certificates(store, mongodb, &roles).await?;
    }

    let mut report = MaterializeReport::default();
    report.record(service::ensure_governing_service(store, &namespace, &config.governing_service).await?);
    report.record(secret::ensure_auth_secret(store, mongodb).await?);
    if mongodb.spec.topology.is_clustered() && mongodb.spec.cluster_auth_mode.uses_key_file() {
        report.record(secret::ensure_key_file_secret(store, mongodb).await?);
    }

    for role in &roles {
        if config.enable_rbac {
            report.record(create_or_patch(store, &rbac::service_account(mongodb, role)).await?);
            report.record(create_or_patch(store, &rbac::role(mongodb, role)).await?);
            report.record(create_or_patch(store, &rbac::role_binding(mongodb, role)).await?);
        }

        let verb = if role.is_stateful() {
            create_or_patch(store, &workload::statefulset(mongodb, role, config)).await?
        } else {
            create_or_patch(store, &workload::mongos_deployment(mongodb, role, &roles, config))
                .await?
        };
        debug!(workload = %role.workload, ?verb, "Ensured workload");
        report.record(verb);
    }

    let (verb, monitor_location) = monitor::sync_service_monitor(store, mongodb).await?;
    report.record(verb);
    let mut data_service = service::data_service(mongodb, &roles);
    if let Some(location) = &monitor_location {
        monitor::record_location(&mut data_service, location);
    }
    report.record(create_or_patch(store, &data_service).await?);

    info!(
        name = %mongodb.name_any(),
        namespace = %namespace,
        created = report.created,
        patched = report.patched,
        unchanged = report.unchanged,
        "Materialized topology"
    );
    Ok(report)
}

/// Workloads whose ready members are below the desired count
pub async fn unready_workloads(ctx: &Context, mongodb: &MongoDB) -> Result<Vec<String>> {
    let namespace = mongodb.namespace().unwrap_or_default();
    let mut unready = Vec::new();
    for role in plan_roles(mongodb) {
        let ready = if role.is_stateful() {
            match ctx.store.get::<StatefulSet>(&namespace, &role.workload).await? {
                Lookup::Found(sts) => sts.status.and_then(|s| s.ready_replicas).unwrap_or(0),
                Lookup::NotFound => 0,
            }
        } else {
            match ctx.store.get::<Deployment>(&namespace, &role.workload).await? {
                Lookup::Found(deploy) => deploy.status.and_then(|s| s.ready_replicas).unwrap_or(0),
                Lookup::NotFound => 0,
            }
        };
        if ready < role.replicas {
            unready.push(role.workload);
        }
    }
    Ok(unready)
}
