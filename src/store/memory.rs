//! In-process store backend
//!
//! Mimics the parts of API server behaviour the controllers depend on:
//! resource versions, generation bumps on spec changes, finalizer-gated
//! deletion and owner-reference garbage collection. Writes that change
//! nothing are not counted, which lets tests assert idempotency.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use json_patch::PatchErrorKind;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use super::{
    LabelSelector, Lookup, ObjectKey, Propagation, ResourceKind, ResourceStoreClient, StorePatch,
    WatchEvent, matches_selector,
};
use crate::controller::error::{Error, Result};

const WATCH_BUFFER: usize = 1024;

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
    next_uid: u64,
    writes: BTreeMap<ResourceKind, u64>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn record_write(&mut self, kind: ResourceKind) {
        *self.writes.entry(kind).or_default() += 1;
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<(ObjectKey, WatchEvent)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Number of effective writes made to objects of a kind
    pub fn writes(&self, kind: ResourceKind) -> u64 {
        self.state.lock().writes.get(&kind).copied().unwrap_or(0)
    }

    /// Effective writes summed over every kind except the listed ones
    pub fn writes_excluding(&self, excluded: &[ResourceKind]) -> u64 {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(kind, _)| !excluded.contains(kind))
            .map(|(_, n)| *n)
            .sum()
    }

    /// Snapshot of every stored object of a kind
    pub fn objects(&self, kind: ResourceKind) -> Vec<Value> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|key| key.kind == kind)
            .count()
    }

    pub fn snapshot(&self, key: &ObjectKey) -> Option<Value> {
        self.state.lock().objects.get(key).cloned()
    }

    fn publish(&self, key: &ObjectKey, event: WatchEvent) {
        // No receivers is fine
        let _ = self.events.send((key.clone(), event));
    }

    /// Remove an object and everything it transitively owns.
    ///
    /// Dependents holding finalizers are only marked for deletion.
    fn remove_cascading(state: &mut State, key: ObjectKey) -> Vec<(ObjectKey, WatchEvent)> {
        let mut emitted = Vec::new();
        let mut pending = vec![key];

        while let Some(key) = pending.pop() {
            let Some(object) = state.objects.remove(&key) else {
                continue;
            };
            state.record_write(key.kind);
            let uid = object
                .pointer("/metadata/uid")
                .and_then(Value::as_str)
                .map(str::to_string);
            emitted.push((key, WatchEvent::Deleted(object)));

            let Some(uid) = uid else { continue };
            let dependents: Vec<ObjectKey> = state
                .objects
                .iter()
                .filter(|(_, value)| is_owned_by(value, &uid))
                .map(|(k, _)| k.clone())
                .collect();

            for dependent in dependents {
                let finalized = state
                    .objects
                    .get(&dependent)
                    .is_some_and(|v| !finalizers(v).is_empty());
                if finalized {
                    let version = state.next_version();
                    if let Some(value) = state.objects.get_mut(&dependent) {
                        mark_deleting(value, &version);
                        emitted.push((dependent.clone(), WatchEvent::Applied(value.clone())));
                    }
                    state.record_write(dependent.kind);
                } else {
                    pending.push(dependent);
                }
            }
        }
        emitted
    }
}

fn is_owned_by(value: &Value, uid: &str) -> bool {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid))
        })
}

fn finalizers(value: &Value) -> Vec<&str> {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn is_deleting(value: &Value) -> bool {
    value
        .pointer("/metadata/deletionTimestamp")
        .is_some_and(|v| !v.is_null())
}

fn mark_deleting(value: &mut Value, version: &str) {
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.entry("deletionTimestamp")
            .or_insert_with(|| json!(now()));
        meta.insert("resourceVersion".into(), json!(version));
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Kinds whose status lives in a sub-resource
fn has_status_subresource(kind: ResourceKind) -> bool {
    matches!(kind, ResourceKind::MongoDB | ResourceKind::DormantDatabase)
}

/// Fields the server owns and clients cannot overwrite
fn restore_server_fields(kind: ResourceKind, old: &Value, new: &mut Value) {
    for field in ["uid", "creationTimestamp", "generation", "name", "namespace"] {
        let previous = old.pointer(&format!("/metadata/{}", field)).cloned();
        if let Some(meta) = new.get_mut("metadata").and_then(Value::as_object_mut) {
            match previous {
                Some(v) => {
                    meta.insert(field.into(), v);
                }
                None => {
                    meta.remove(field);
                }
            }
        }
    }
    if has_status_subresource(kind) {
        if let Some(obj) = new.as_object_mut() {
            match old.get("status") {
                Some(status) => {
                    obj.insert("status".into(), status.clone());
                }
                None => {
                    obj.remove("status");
                }
            }
        }
    }
}

#[async_trait]
impl ResourceStoreClient for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Lookup<Value>> {
        Ok(match self.state.lock().objects.get(key) {
            Some(value) => Lookup::Found(value.clone()),
            None => Lookup::NotFound,
        })
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Value>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .filter(|(_, value)| matches_selector(value, selector))
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn create(&self, kind: ResourceKind, mut object: Value) -> Result<Value> {
        let key = ObjectKey::of_value(kind, &object)?;
        let created = {
            let mut state = self.state.lock();
            if state.objects.contains_key(&key) {
                return Err(Error::AlreadyExists(key.to_string()));
            }

            let version = state.next_version();
            state.next_uid += 1;
            let uid = format!("uid-{}", state.next_uid);

            let obj = object
                .as_object_mut()
                .ok_or_else(|| Error::InvalidConfig(format!("{} is not an object", key)))?;
            if has_status_subresource(kind) {
                obj.remove("status");
            }
            let meta = obj
                .entry("metadata")
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .ok_or(Error::MissingObjectKey(".metadata"))?;
            meta.insert("resourceVersion".into(), json!(version));
            meta.insert("uid".into(), json!(uid));
            meta.insert("generation".into(), json!(1));
            meta.insert("creationTimestamp".into(), json!(now()));
            meta.remove("deletionTimestamp");

            state.objects.insert(key.clone(), object.clone());
            state.record_write(kind);
            object
        };
        self.publish(&key, WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn patch(&self, key: &ObjectKey, patch: &StorePatch) -> Result<Lookup<Value>> {
        let (result, emitted) = {
            let mut state = self.state.lock();
            let Some(old) = state.objects.get(key).cloned() else {
                return Ok(Lookup::NotFound);
            };

            let mut new = old.clone();
            match patch {
                StorePatch::Json(ops) => {
                    json_patch::patch(&mut new, ops).map_err(|e| match e.kind {
                        PatchErrorKind::TestFailed => {
                            Error::Conflict(format!("{} was modified concurrently", key))
                        }
                        _ => Error::PatchError(e),
                    })?;
                }
                StorePatch::Merge(body) => {
                    let expected = body.pointer("/metadata/resourceVersion");
                    let actual = old.pointer("/metadata/resourceVersion");
                    if expected.is_some_and(|e| Some(e) != actual) {
                        return Err(Error::Conflict(format!(
                            "{} was modified concurrently",
                            key
                        )));
                    }
                    json_patch::merge(&mut new, body);
                }
            }
            restore_server_fields(key.kind, &old, &mut new);
            if let (Some(meta), Some(version)) = (
                new.get_mut("metadata").and_then(Value::as_object_mut),
                old.pointer("/metadata/resourceVersion").cloned(),
            ) {
                meta.insert("resourceVersion".into(), version);
            }

            if new == old {
                return Ok(Lookup::Found(old));
            }

            if new.get("spec") != old.get("spec") {
                let generation = old
                    .pointer("/metadata/generation")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if let Some(meta) = new.get_mut("metadata").and_then(Value::as_object_mut) {
                    meta.insert("generation".into(), json!(generation + 1));
                }
            }
            let version = state.next_version();
            if let Some(meta) = new.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert("resourceVersion".into(), json!(version));
            }

            if is_deleting(&new) && finalizers(&new).is_empty() {
                state.objects.insert(key.clone(), new.clone());
                let emitted = Self::remove_cascading(&mut state, key.clone());
                (new, emitted)
            } else {
                state.objects.insert(key.clone(), new.clone());
                state.record_write(key.kind);
                (new.clone(), vec![(key.clone(), WatchEvent::Applied(new))])
            }
        };
        for (k, event) in emitted {
            self.publish(&k, event);
        }
        Ok(Lookup::Found(result))
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<Lookup<Value>> {
        let (result, changed) = {
            let mut state = self.state.lock();
            let Some(old) = state.objects.get(key).cloned() else {
                return Ok(Lookup::NotFound);
            };
            let Some(status_patch) = patch.get("status") else {
                return Ok(Lookup::Found(old));
            };

            let mut new = old.clone();
            if let Some(obj) = new.as_object_mut() {
                let status = obj.entry("status").or_insert_with(|| json!({}));
                json_patch::merge(status, status_patch);
            }
            if new == old {
                return Ok(Lookup::Found(old));
            }

            let version = state.next_version();
            if let Some(meta) = new.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert("resourceVersion".into(), json!(version));
            }
            state.objects.insert(key.clone(), new.clone());
            state.record_write(key.kind);
            (new, true)
        };
        if changed {
            self.publish(key, WatchEvent::Applied(result.clone()));
        }
        Ok(Lookup::Found(result))
    }

    async fn delete(&self, key: &ObjectKey, _propagation: Propagation) -> Result<Lookup<()>> {
        let emitted = {
            let mut state = self.state.lock();
            let Some(object) = state.objects.get(key) else {
                return Ok(Lookup::NotFound);
            };

            if finalizers(object).is_empty() {
                Self::remove_cascading(&mut state, key.clone())
            } else if is_deleting(object) {
                Vec::new()
            } else {
                let version = state.next_version();
                let mut emitted = Vec::new();
                if let Some(value) = state.objects.get_mut(key) {
                    mark_deleting(value, &version);
                    emitted.push((key.clone(), WatchEvent::Applied(value.clone())));
                }
                state.record_write(key.kind);
                emitted
            }
        };
        for (k, event) in emitted {
            self.publish(&k, event);
        }
        Ok(Lookup::Found(()))
    }

    fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>> {
        let namespace = namespace.map(str::to_string);

        // Subscribe while holding the lock so no change falls between the
        // initial listing and the live feed
        let (initial, receiver) = {
            let state = self.state.lock();
            let initial: Vec<Result<WatchEvent>> = state
                .objects
                .iter()
                .filter(|(key, _)| key.kind == kind)
                .filter(|(key, _)| namespace.is_none() || key.namespace == namespace)
                .map(|(_, value)| Ok(WatchEvent::Applied(value.clone())))
                .collect();
            (initial, self.events.subscribe())
        };

        let live = stream::unfold(receiver, move |mut receiver| {
            let namespace = namespace.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((key, event)) => {
                            if key.kind == kind
                                && (namespace.is_none() || key.namespace == namespace)
                            {
                                return Some((Ok(event), receiver));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::iter(initial).chain(live).boxed()
    }
}
