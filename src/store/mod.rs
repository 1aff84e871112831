//! Client abstraction over the declarative resource store
//!
//! Objects are addressed by `(kind, namespace, name)` and exchanged as JSON
//! values. Absence is a normal outcome (`Lookup::NotFound`), every other
//! failure is an [`Error`]. Two backends exist: [`KubeStore`] talks to the
//! API server, [`MemoryStore`] keeps everything in process.

mod apply;
mod kube_store;
mod memory;
mod registry;

pub use self::apply::{Verb, create_or_patch, upsert_merge};
pub use self::kube_store::KubeStore;
pub use self::memory::MemoryStore;
pub use self::registry::KindRegistry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::controller::error::{Error, Result};
use crate::crd::{DormantDatabase, MongoDB, ServiceMonitor};

/// Every kind the operator reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    MongoDB,
    DormantDatabase,
    Secret,
    Service,
    StatefulSet,
    Deployment,
    ServiceAccount,
    Role,
    RoleBinding,
    Job,
    CronJob,
    Pod,
    PersistentVolumeClaim,
    StorageClass,
    ServiceMonitor,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 15] = [
        ResourceKind::MongoDB,
        ResourceKind::DormantDatabase,
        ResourceKind::Secret,
        ResourceKind::Service,
        ResourceKind::StatefulSet,
        ResourceKind::Deployment,
        ResourceKind::ServiceAccount,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::Job,
        ResourceKind::CronJob,
        ResourceKind::Pod,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::StorageClass,
        ResourceKind::ServiceMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::MongoDB => "MongoDB",
            ResourceKind::DormantDatabase => "DormantDatabase",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::Job => "Job",
            ResourceKind::CronJob => "CronJob",
            ResourceKind::Pod => "Pod",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::StorageClass => "StorageClass",
            ResourceKind::ServiceMonitor => "ServiceMonitor",
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ResourceKind::StorageClass)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Build a key, dropping the namespace for cluster-scoped kinds
    pub fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: kind.is_namespaced().then(|| namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(kind: ResourceKind, name: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Key of a JSON object, read from its metadata
    pub fn of_value(kind: ResourceKind, value: &Value) -> Result<Self> {
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let namespace = value.pointer("/metadata/namespace").and_then(Value::as_str);
        match (kind.is_namespaced(), namespace) {
            (true, Some(ns)) => Ok(Self::new(kind, ns, name)),
            (true, None) => Err(Error::MissingObjectKey(".metadata.namespace")),
            (false, _) => Ok(Self::cluster(kind, name)),
        }
    }

    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Outcome of a point lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(t) => Some(t),
            Lookup::NotFound => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(t) => Lookup::Found(f(t)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

/// Deletion propagation, chosen per call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are removed before the owner disappears
    Foreground,
    /// The owner disappears first, dependents are collected afterwards
    Background,
}

/// Patch body sent to the store
#[derive(Debug, Clone)]
pub enum StorePatch {
    /// RFC 7386 merge patch
    Merge(Value),
    /// RFC 6902 JSON patch, may carry `test` preconditions
    Json(json_patch::Patch),
}

/// Change notification for a watched kind
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Value),
    Deleted(Value),
}

/// Equality-based label selector
pub type LabelSelector = BTreeMap<String, String>;

/// Typed CRUD and watch over the declarative store
#[async_trait]
pub trait ResourceStoreClient: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Lookup<Value>>;

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Value>>;

    /// Create an object; fails with `AlreadyExists` when the name is taken
    async fn create(&self, kind: ResourceKind, object: Value) -> Result<Value>;

    /// Patch an object; a failed precondition yields `Error::Conflict`
    async fn patch(&self, key: &ObjectKey, patch: &StorePatch) -> Result<Lookup<Value>>;

    /// Merge-patch the status sub-resource
    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<Lookup<Value>>;

    async fn delete(&self, key: &ObjectKey, propagation: Propagation) -> Result<Lookup<()>>;

    /// Stream of changes for one kind, optionally restricted to a namespace
    fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>>;
}

/// Types with a fixed kind in the store
pub trait StoredResource: Serialize + DeserializeOwned + Send + Sync {
    const KIND: ResourceKind;
}

macro_rules! stored_resource {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl StoredResource for $ty {
            const KIND: ResourceKind = ResourceKind::$kind;
        })*
    };
}

stored_resource! {
    MongoDB => MongoDB,
    DormantDatabase => DormantDatabase,
    Secret => Secret,
    Service => Service,
    StatefulSet => StatefulSet,
    Deployment => Deployment,
    ServiceAccount => ServiceAccount,
    Role => Role,
    RoleBinding => RoleBinding,
    Job => Job,
    CronJob => CronJob,
    Pod => Pod,
    PersistentVolumeClaim => PersistentVolumeClaim,
    StorageClass => StorageClass,
    ServiceMonitor => ServiceMonitor,
}

/// Typed facade over a [`ResourceStoreClient`]
#[derive(Clone)]
pub struct Store {
    client: Arc<dyn ResourceStoreClient>,
}

impl Store {
    pub fn new(client: Arc<dyn ResourceStoreClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn ResourceStoreClient> {
        &self.client
    }

    pub async fn get<K: StoredResource>(&self, namespace: &str, name: &str) -> Result<Lookup<K>> {
        let key = ObjectKey::new(K::KIND, namespace, name);
        match self.client.get(&key).await? {
            Lookup::Found(value) => Ok(Lookup::Found(serde_json::from_value(value)?)),
            Lookup::NotFound => Ok(Lookup::NotFound),
        }
    }

    /// Whether an object exists, without decoding it
    pub async fn exists(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<bool> {
        let key = ObjectKey::new(kind, namespace, name);
        Ok(self.client.get(&key).await?.is_found())
    }

    pub async fn list<K: StoredResource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>> {
        self.client
            .list(K::KIND, namespace, selector)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }

    pub async fn create<K: StoredResource>(&self, object: &K) -> Result<K> {
        let created = self
            .client
            .create(K::KIND, serde_json::to_value(object)?)
            .await?;
        Ok(serde_json::from_value(created)?)
    }

    pub async fn patch<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &StorePatch,
    ) -> Result<Lookup<K>> {
        let key = ObjectKey::new(K::KIND, namespace, name);
        match self.client.patch(&key, patch).await? {
            Lookup::Found(value) => Ok(Lookup::Found(serde_json::from_value(value)?)),
            Lookup::NotFound => Ok(Lookup::NotFound),
        }
    }

    /// Merge-patch shortcut
    pub async fn merge<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<Lookup<K>> {
        self.patch(namespace, name, &StorePatch::Merge(patch)).await
    }

    pub async fn patch_status<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
        status: &impl Serialize,
    ) -> Result<Lookup<K>> {
        let key = ObjectKey::new(K::KIND, namespace, name);
        let patch = serde_json::json!({ "status": status });
        match self.client.patch_status(&key, &patch).await? {
            Lookup::Found(value) => Ok(Lookup::Found(serde_json::from_value(value)?)),
            Lookup::NotFound => Ok(Lookup::NotFound),
        }
    }

    pub async fn delete<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<Lookup<()>> {
        let key = ObjectKey::new(K::KIND, namespace, name);
        self.client.delete(&key, propagation).await
    }
}

/// Whether an object's labels satisfy an equality selector
pub(crate) fn matches_selector(value: &Value, selector: &LabelSelector) -> bool {
    let labels = value.pointer("/metadata/labels").and_then(Value::as_object);
    selector.iter().all(|(k, v)| {
        labels
            .and_then(|l| l.get(k))
            .and_then(Value::as_str)
            .is_some_and(|actual| actual == v)
    })
}

/// Render an equality selector in API server syntax
pub(crate) fn selector_string(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
