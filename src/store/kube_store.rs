//! Store backend talking to the Kubernetes API server

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, stream};
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

use super::{
    KindRegistry, LabelSelector, Lookup, ObjectKey, Propagation, ResourceKind,
    ResourceStoreClient, StorePatch, WatchEvent, selector_string,
};
use crate::controller::error::{Error, Result};

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: Arc<KindRegistry>,
}

impl KubeStore {
    pub fn new(client: Client, registry: Arc<KindRegistry>) -> Self {
        Self { client, registry }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let resource = self.registry.resolve(kind)?;
        Ok(match (kind.is_namespaced(), namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, resource),
            _ => Api::all_with(self.client.clone(), resource),
        })
    }
}

/// Map API failures onto the store's error kinds
fn classify(err: kube::Error) -> Error {
    if let kube::Error::Api(resp) = &err {
        if resp.code == 409 && resp.reason == "AlreadyExists" {
            return Error::AlreadyExists(resp.message.clone());
        }
        if resp.code == 409 {
            return Error::Conflict(resp.message.clone());
        }
        // A failed JSON patch `test` operation is reported as unprocessable
        if resp.code == 422 && resp.message.contains("test") {
            return Error::Conflict(resp.message.clone());
        }
    }
    Error::KubeError(err)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl ResourceStoreClient for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Lookup<Value>> {
        let api = self.api(key.kind, key.namespace.as_deref())?;
        match api.get_opt(&key.name).await.map_err(classify)? {
            Some(obj) => Ok(Lookup::Found(serde_json::to_value(obj)?)),
            None => Ok(Lookup::NotFound),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Value>> {
        let api = self.api(kind, namespace)?;
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let list = api.list(&params).await.map_err(classify)?;
        list.items
            .into_iter()
            .map(|obj| serde_json::to_value(obj).map_err(Error::from))
            .collect()
    }

    async fn create(&self, kind: ResourceKind, object: Value) -> Result<Value> {
        let key = ObjectKey::of_value(kind, &object)?;
        let api = self.api(kind, key.namespace.as_deref())?;
        let obj: DynamicObject = serde_json::from_value(object)?;
        let created = api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(classify)?;
        debug!(object = %key, "Created object");
        Ok(serde_json::to_value(created)?)
    }

    async fn patch(&self, key: &ObjectKey, patch: &StorePatch) -> Result<Lookup<Value>> {
        let api = self.api(key.kind, key.namespace.as_deref())?;
        let params = PatchParams::default();
        let result = match patch {
            StorePatch::Merge(body) => api.patch(&key.name, &params, &Patch::Merge(body)).await,
            StorePatch::Json(ops) => {
                api.patch(&key.name, &params, &Patch::<Value>::Json(ops.clone()))
                    .await
            }
        };
        match result {
            Ok(obj) => Ok(Lookup::Found(serde_json::to_value(obj)?)),
            Err(e) if is_not_found(&e) => Ok(Lookup::NotFound),
            Err(e) => Err(classify(e)),
        }
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<Lookup<Value>> {
        let api = self.api(key.kind, key.namespace.as_deref())?;
        match api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            Ok(obj) => Ok(Lookup::Found(serde_json::to_value(obj)?)),
            Err(e) if is_not_found(&e) => Ok(Lookup::NotFound),
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete(&self, key: &ObjectKey, propagation: Propagation) -> Result<Lookup<()>> {
        let api = self.api(key.kind, key.namespace.as_deref())?;
        let params = match propagation {
            Propagation::Foreground => DeleteParams::foreground(),
            Propagation::Background => DeleteParams::background(),
        };
        match api.delete(&key.name, &params).await {
            Ok(_) => {
                debug!(object = %key, ?propagation, "Deleted object");
                Ok(Lookup::Found(()))
            }
            Err(e) if is_not_found(&e) => Ok(Lookup::NotFound),
            Err(e) => Err(classify(e)),
        }
    }

    fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>> {
        let api = match self.api(kind, namespace) {
            Ok(api) => api,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        watcher(api, watcher::Config::default().any_semantic())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => Some(
                        serde_json::to_value(obj)
                            .map(WatchEvent::Applied)
                            .map_err(Error::from),
                    ),
                    Ok(watcher::Event::Delete(obj)) => Some(
                        serde_json::to_value(obj)
                            .map(WatchEvent::Deleted)
                            .map_err(Error::from),
                    ),
                    Ok(_) => None,
                    Err(e) => Some(Err(Error::TransientError(format!("watch failed: {}", e)))),
                }
            })
            .boxed()
    }
}
