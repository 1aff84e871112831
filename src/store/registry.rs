//! Registration table of the kinds the operator works with
//!
//! Built once at startup and handed to the store; nothing is looked up
//! through process-wide state.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::discovery::ApiResource;

use super::ResourceKind;
use crate::controller::error::{Error, Result};
use crate::crd::{DormantDatabase, MongoDB, ServiceMonitor};

#[derive(Clone, Debug, Default)]
pub struct KindRegistry {
    entries: BTreeMap<ResourceKind, ApiResource>,
}

impl KindRegistry {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every kind the controllers touch
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(ResourceKind::MongoDB, ApiResource::erase::<MongoDB>(&()));
        registry.register(
            ResourceKind::DormantDatabase,
            ApiResource::erase::<DormantDatabase>(&()),
        );
        registry.register(ResourceKind::Secret, ApiResource::erase::<Secret>(&()));
        registry.register(ResourceKind::Service, ApiResource::erase::<Service>(&()));
        registry.register(ResourceKind::StatefulSet, ApiResource::erase::<StatefulSet>(&()));
        registry.register(ResourceKind::Deployment, ApiResource::erase::<Deployment>(&()));
        registry.register(
            ResourceKind::ServiceAccount,
            ApiResource::erase::<ServiceAccount>(&()),
        );
        registry.register(ResourceKind::Role, ApiResource::erase::<Role>(&()));
        registry.register(ResourceKind::RoleBinding, ApiResource::erase::<RoleBinding>(&()));
        registry.register(ResourceKind::Job, ApiResource::erase::<Job>(&()));
        registry.register(ResourceKind::CronJob, ApiResource::erase::<CronJob>(&()));
        registry.register(ResourceKind::Pod, ApiResource::erase::<Pod>(&()));
        registry.register(
            ResourceKind::PersistentVolumeClaim,
            ApiResource::erase::<PersistentVolumeClaim>(&()),
        );
        registry.register(ResourceKind::StorageClass, ApiResource::erase::<StorageClass>(&()));
        registry.register(
            ResourceKind::ServiceMonitor,
            ApiResource::erase::<ServiceMonitor>(&()),
        );
        registry
    }

    pub fn register(&mut self, kind: ResourceKind, resource: ApiResource) {
        self.entries.insert(kind, resource);
    }

    pub fn resolve(&self, kind: ResourceKind) -> Result<&ApiResource> {
        self.entries
            .get(&kind)
            .ok_or_else(|| Error::InvalidConfig(format!("kind {} is not registered", kind)))
    }

    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.entries.keys().copied()
    }
}
