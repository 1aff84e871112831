//! Certificate secrets a TLS-enabled topology depends on
//!
//! Certificates are issued outside the operator. Before any workload is
//! written the full set implied by the topology must exist; a partial set
//! fails the reconcile without touching a single workload.

use kube::ResourceExt;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::MongoDB;
use crate::resources::topology::RolePlan;
use crate::store::{ResourceKind, Store};

/// Reason code reported while certificates are missing
pub const WAITING_ON_CERTIFICATES: &str = "WaitingOnCertificates";

pub fn server_cert_name(workload: &str) -> String {
    format!("{}-server-cert", workload)
}

pub fn client_cert_name(name: &str) -> String {
    format!("{}-client-cert", name)
}

pub fn metrics_exporter_cert_name(name: &str) -> String {
    format!("{}-metrics-exporter-cert", name)
}

/// Names of every secret a TLS-enabled topology needs
pub fn required_secrets(mongodb: &MongoDB, roles: &[RolePlan]) -> Vec<String> {
    if !mongodb.tls_enabled() {
        return Vec::new();
    }
    let name = mongodb.name_any();
    let mut secrets: Vec<String> = roles.iter().map(|r| server_cert_name(&r.workload)).collect();
    secrets.push(client_cert_name(&name));
    secrets.push(metrics_exporter_cert_name(&name));
    secrets
}

/// Secrets from [`required_secrets`] absent from the store
pub async fn missing_secrets(
    store: &Store,
    mongodb: &MongoDB,
    roles: &[RolePlan],
) -> Result<Vec<String>> {
    let namespace = mongodb.namespace().unwrap_or_default();
    let mut missing = Vec::new();
    for secret in required_secrets(mongodb, roles) {
        if !store.exists(ResourceKind::Secret, &namespace, &secret).await? {
            missing.push(secret);
        }
    }
    Ok(missing)
}

/// Fail with `DependencyNotReady` unless every certificate secret exists
pub async fn check_certificates(store: &Store, mongodb: &MongoDB, roles: &[RolePlan]) -> Result<()> {
    let missing = missing_secrets(store, mongodb, roles).await?;
    if missing.is_empty() {
        debug!(name = %mongodb.name_any(), "All certificate secrets present");
        return Ok(());
    }
    Err(Error::not_ready(
        WAITING_ON_CERTIFICATES,
        format!("waiting on certificate secrets: {}", missing.join(", ")),
    ))
}
