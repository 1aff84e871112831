//! Service generation for MongoDB topologies
//!
//! Two services exist per database namespace: the shared headless governing
//! service giving StatefulSet members stable DNS names, and one data service
//! per database routing clients to its entry role.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use tracing::info;

use crate::controller::error::{Error, Result};
use crate::crd::{AgentKind, MongoDB, MonitorAgent};
use crate::resources::common::{FIELD_MANAGER, owned_meta, role_labels, standard_labels};
use crate::resources::topology::{DATABASE_PORT, RolePlan, entry_role};
use crate::resources::workload::{DB_PORT_NAME, EXPORTER_PORT_NAME};
use crate::store::{Lookup, Store, Verb};

/// Selector shared by every pod the operator manages
fn managed_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    )])
}

/// Headless service backing the stable member identities
pub fn governing_service(namespace: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_selector()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(managed_selector()),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![ServicePort {
                name: Some(DB_PORT_NAME.to_string()),
                port: DATABASE_PORT,
                target_port: Some(IntOrString::Int(DATABASE_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the governing service if the namespace has none.
///
/// It is shared by every database in the namespace and never owned by one
/// of them, so an existing service is left as it is.
pub async fn ensure_governing_service(store: &Store, namespace: &str, name: &str) -> Result<Verb> {
    if let Lookup::Found(_) = store.get::<Service>(namespace, name).await? {
        return Ok(Verb::Unchanged);
    }
    match store.create(&governing_service(namespace, name)).await {
        Ok(_) => {
            info!(namespace = %namespace, service = %name, "Created governing service");
            Ok(Verb::Created)
        }
        Err(Error::AlreadyExists(_)) => Ok(Verb::Unchanged),
        Err(e) => Err(e),
    }
}

/// Client-facing service of a database
pub fn data_service(mongodb: &MongoDB, roles: &[RolePlan]) -> Service {
    let name = mongodb.name_any();
    let selector = match entry_role(roles) {
        Some(role) => role_labels(&name, &role.selector_role()),
        None => standard_labels(&name),
    };

    let mut ports = vec![ServicePort {
        name: Some(DB_PORT_NAME.to_string()),
        port: DATABASE_PORT,
        target_port: Some(IntOrString::String(DB_PORT_NAME.to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];

    let mut metadata = owned_meta(mongodb, name.clone(), standard_labels(&name));
    if let MonitorAgent::Prometheus { agent, port } = mongodb.monitor_agent() {
        ports.push(ServicePort {
            name: Some(EXPORTER_PORT_NAME.to_string()),
            port,
            target_port: Some(IntOrString::String(EXPORTER_PORT_NAME.to_string())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
        if agent == AgentKind::PrometheusBuiltin {
            metadata.annotations = Some(BTreeMap::from([
                ("prometheus.io/scrape".to_string(), "true".to_string()),
                ("prometheus.io/port".to_string(), port.to_string()),
                ("prometheus.io/path".to_string(), "/metrics".to_string()),
            ]));
        }
    }

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}
