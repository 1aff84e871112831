//! Service account, role and binding per role workload

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;

use crate::crd::MongoDB;
use crate::resources::common::{owned_meta, standard_labels};
use crate::resources::topology::RolePlan;

pub fn service_account(mongodb: &MongoDB, role: &RolePlan) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(mongodb, role.workload.clone(), standard_labels(&mongodb.name_any())),
        ..Default::default()
    }
}

/// Members read their certificate secret and discover their peers
pub fn role(mongodb: &MongoDB, role: &RolePlan) -> Role {
    Role {
        metadata: owned_meta(mongodb, role.workload.clone(), standard_labels(&mongodb.name_any())),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["secrets".to_string()]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
        ]),
    }
}

pub fn role_binding(mongodb: &MongoDB, role: &RolePlan) -> RoleBinding {
    RoleBinding {
        metadata: owned_meta(mongodb, role.workload.clone(), standard_labels(&mongodb.name_any())),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role.workload.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: role.workload.clone(),
            namespace: mongodb.namespace(),
            ..Default::default()
        }]),
    }
}
