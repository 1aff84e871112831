//! Defaulting applied before validation
//!
//! Defaults only fill what the object leaves unset. The outcome is returned
//! to the API server as an RFC 6902 patch against the submitted object.

use kube::ResourceExt;

use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::crd::{
    DEFAULT_EXPORTER_PORT, DormantDatabase, INITIALIZED_ANNOTATION, MONGODB_KIND, MongoDB,
    SecretReference, Topology, default_auth_secret_name,
};

/// The object with every default applied
pub fn default_mongodb(
    mongodb: &MongoDB,
    dormant: Option<&DormantDatabase>,
    config: &OperatorConfig,
) -> MongoDB {
    let mut defaulted = mongodb.clone();
    let spec = &mut defaulted.spec;

    let origin = dormant.filter(|record| record.origin_kind() == Some(MONGODB_KIND));

    match spec.topology {
        Topology::Standalone if config.force_standalone_replicas => spec.replicas = Some(1),
        Topology::Standalone | Topology::ReplicaSet { .. } => {
            spec.replicas.get_or_insert(1);
        }
        Topology::Sharded(_) => {}
    }

    if spec.auth_secret.is_none() {
        let adopted = origin
            .and_then(|record| record.spec.origin.spec.mongodb.as_ref())
            .and_then(|origin| origin.auth_secret.clone());
        spec.auth_secret = Some(adopted.unwrap_or_else(|| SecretReference {
            name: default_auth_secret_name(&mongodb.name_any()),
        }));
    }

    if let Some(monitor) = spec.monitor.as_mut() {
        monitor
            .prometheus
            .get_or_insert_with(Default::default)
            .port
            .get_or_insert(DEFAULT_EXPORTER_PORT);
    }

    // An init source is applied once per data set, resumed or not
    let declares_init = spec.init.as_ref().is_some_and(|init| init.is_declared());
    let attempted = origin.is_some_and(|record| {
        record
            .spec
            .origin
            .metadata
            .annotations
            .contains_key(INITIALIZED_ANNOTATION)
    });
    if declares_init && attempted {
        defaulted
            .annotations_mut()
            .insert(INITIALIZED_ANNOTATION.to_string(), String::new());
    }

    defaulted
}

/// JSON patch turning `original` into `defaulted`
pub fn mutation_patch(original: &MongoDB, defaulted: &MongoDB) -> Result<json_patch::Patch> {
    let before = serde_json::to_value(original)?;
    let after = serde_json::to_value(defaulted)?;
    Ok(json_patch::diff(&before, &after))
}
