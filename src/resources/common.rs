//! Common utilities for Kubernetes resource generation
//!
//! This module provides shared functions and constants used across
//! all resource generators to ensure consistency and reduce duplication.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements as K8sResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{LABEL_KIND, LABEL_NAME, MongoDB, ResourceList, ResourceRequirements};

/// API version for MongoDB CRD
pub const API_VERSION: &str = "mongodb-operator.smoketurner.com/v1alpha1";

/// Kind for MongoDB CRD
pub const KIND: &str = "MongoDB";

/// Operator field manager name
pub const FIELD_MANAGER: &str = "mongodb-operator";

/// Label carrying the topology role of a workload
pub const LABEL_ROLE: &str = "mongodb-operator.smoketurner.com/role";

/// Generate an owner reference for a MongoDB
///
/// Child resources carrying it are garbage collected by the store when the
/// database is deleted outside the pause path.
pub fn owner_reference(mongodb: &MongoDB) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: mongodb.name_any(),
        uid: mongodb.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels shared by every object belonging to a database
pub fn standard_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "mongodb".to_string()),
        ("app.kubernetes.io/instance".to_string(), name.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (LABEL_KIND.to_string(), KIND.to_string()),
        (LABEL_NAME.to_string(), name.to_string()),
    ])
}

/// Standard labels plus the topology role, used as pod selectors
pub fn role_labels(name: &str, role: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(name);
    labels.insert(LABEL_ROLE.to_string(), role.to_string());
    labels
}

/// Metadata of an owned child object
pub fn owned_meta(
    mongodb: &MongoDB,
    name: impl Into<String>,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: mongodb.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(mongodb)]),
        ..Default::default()
    }
}

/// Metadata of an object that must outlive the database (credentials)
pub fn retained_meta(mongodb: &MongoDB, name: impl Into<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: mongodb.namespace(),
        labels: Some(standard_labels(&mongodb.name_any())),
        ..Default::default()
    }
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

/// Convert declared requirements into container requirements
pub fn resource_requirements(resources: &ResourceRequirements) -> K8sResourceRequirements {
    K8sResourceRequirements {
        limits: resources.limits.as_ref().map(quantities),
        requests: resources.requests.as_ref().map(quantities),
        ..Default::default()
    }
}
