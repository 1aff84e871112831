//! Idempotent create-or-patch of controller-owned objects

use std::collections::{BTreeMap, BTreeSet};

use json_patch::jsonptr::PointerBuf;
use json_patch::{PatchOperation, TestOperation};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Lookup, ObjectKey, Store, StorePatch, StoredResource};
use crate::controller::error::{Error, Result};
use crate::crd::{LABEL_KIND, LABEL_NAME};

/// Annotation recording which list items and annotations the controller
/// wrote, so the ones it stops writing can be removed later
pub const MANAGED_ITEMS_ANNOTATION: &str = "mongodb-operator.smoketurner.com/managed-items";

/// Names written by the controller, keyed by the path of their list
type ManagedItems = BTreeMap<String, BTreeSet<String>>;

/// What `create_or_patch` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Created,
    Patched,
    Unchanged,
}

/// Ensure an object matches its desired form.
///
/// Absent objects are created. Present objects receive only the fields the
/// desired form sets; anything else on the live object, such as a sidecar a
/// user added, is left alone. Named items and annotations the controller
/// wrote on an earlier pass but no longer desires are removed. The patch is
/// conditional on the resource version that was read.
pub async fn create_or_patch<K: StoredResource>(store: &Store, desired: &K) -> Result<Verb> {
    let mut desired = serde_json::to_value(desired)?;
    let key = ObjectKey::of_value(K::KIND, &desired)?;
    let client = store.client();

    let managed = managed_items(&desired);
    if !managed.is_empty() {
        annotate_managed(&mut desired, &managed)?;
    }

    let live = match client.get(&key).await? {
        Lookup::NotFound => {
            return match client.create(K::KIND, desired).await {
                Ok(_) => {
                    debug!(object = %key, "Created child object");
                    Ok(Verb::Created)
                }
                // Lost a race with another writer; re-read on the next pass
                Err(Error::AlreadyExists(msg)) => Err(Error::Conflict(msg)),
                Err(e) => Err(e),
            };
        }
        Lookup::Found(live) => live,
    };

    check_ownership(&key, &live, &desired)?;

    let mut merged = live.clone();
    upsert_merge(&mut merged, &desired);
    let previous = recorded_items(&key, &live);
    if !previous.is_empty() {
        prune_unmanaged(&mut merged, &previous, &managed);
        if managed.is_empty() {
            annotate_managed(&mut merged, &managed)?;
        }
    }
    let mut patch = json_patch::diff(&live, &merged);
    if patch.0.is_empty() {
        return Ok(Verb::Unchanged);
    }

    if let Some(version) = live.pointer("/metadata/resourceVersion") {
        patch.0.insert(
            0,
            PatchOperation::Test(TestOperation {
                path: PointerBuf::from_tokens(["metadata", "resourceVersion"]),
                value: version.clone(),
            }),
        );
    }

    match client.patch(&key, &StorePatch::Json(patch)).await? {
        Lookup::Found(_) => {
            debug!(object = %key, "Patched child object");
            Ok(Verb::Patched)
        }
        Lookup::NotFound => Err(Error::Conflict(format!("{} vanished while patching", key))),
    }
}

/// Refuse to take over an object that another database claims
fn check_ownership(key: &ObjectKey, live: &Value, desired: &Value) -> Result<()> {
    for label in [LABEL_KIND, LABEL_NAME] {
        let pointer = format!("/metadata/labels/{}", label.replace('/', "~1"));
        let wanted = desired.pointer(&pointer).and_then(Value::as_str);
        let actual = live.pointer(&pointer).and_then(Value::as_str);
        if let (Some(wanted), Some(actual)) = (wanted, actual) {
            if wanted != actual {
                return Err(Error::OwnershipConflict(format!(
                    "intended {} already exists and belongs to {} {}",
                    key, label, actual
                )));
            }
        }
    }
    Ok(())
}

/// Overlay `desired` onto `target`.
///
/// Objects merge key by key. Lists whose items all carry a `name` (containers,
/// env, volumes, ports) are upserted by name. Any other value is replaced.
pub fn upsert_merge(target: &mut Value, desired: &Value) {
    match (target, desired) {
        (Value::Object(target), Value::Object(desired)) => {
            for (k, v) in desired {
                match target.get_mut(k) {
                    Some(existing) => upsert_merge(existing, v),
                    None => {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(desired))
            if is_named_list(desired) && is_named_list(target) =>
        {
            for item in desired {
                let name = item.get("name");
                match target.iter_mut().find(|existing| existing.get("name") == name) {
                    Some(existing) => upsert_merge(existing, item),
                    None => target.push(item.clone()),
                }
            }
        }
        (target, desired) => *target = desired.clone(),
    }
}

/// Collect every named list and the annotation keys of an object
pub fn managed_items(object: &Value) -> ManagedItems {
    let mut items = ManagedItems::new();
    if let Some(annotations) = object.pointer("/metadata/annotations").and_then(Value::as_object) {
        let keys: BTreeSet<String> = annotations
            .keys()
            .filter(|k| k.as_str() != MANAGED_ITEMS_ANNOTATION)
            .cloned()
            .collect();
        if !keys.is_empty() {
            items.insert("metadata/annotations".to_string(), keys);
        }
    }
    if let Value::Object(fields) = object {
        let mut path = Vec::new();
        for (k, v) in fields.iter().filter(|(k, _)| k.as_str() != "metadata") {
            path.push(k.clone());
            collect_named_lists(v, &mut path, &mut items);
            path.pop();
        }
    }
    items
}

fn collect_named_lists(value: &Value, path: &mut Vec<String>, out: &mut ManagedItems) {
    match value {
        Value::Object(fields) => {
            for (k, v) in fields {
                path.push(k.clone());
                collect_named_lists(v, path, out);
                path.pop();
            }
        }
        Value::Array(items) if is_named_list(items) => {
            let mut names = BTreeSet::new();
            for item in items {
                let Some(name) = item.get("name").and_then(Value::as_str) else {
                    continue;
                };
                names.insert(name.to_string());
                path.push(format!("[{}]", name));
                collect_named_lists(item, path, out);
                path.pop();
            }
            out.insert(path.join("/"), names);
        }
        _ => {}
    }
}

fn annotate_managed(object: &mut Value, managed: &ManagedItems) -> Result<()> {
    let encoded = serde_json::to_string(managed)?;
    if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        let annotations = meta.entry("annotations").or_insert_with(|| json!({}));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(MANAGED_ITEMS_ANNOTATION.to_string(), Value::String(encoded));
        }
    }
    Ok(())
}

fn recorded_items(key: &ObjectKey, live: &Value) -> ManagedItems {
    let pointer = format!(
        "/metadata/annotations/{}",
        MANAGED_ITEMS_ANNOTATION.replace('/', "~1")
    );
    let Some(encoded) = live.pointer(&pointer).and_then(Value::as_str) else {
        return ManagedItems::new();
    };
    serde_json::from_str(encoded).unwrap_or_else(|e| {
        warn!(object = %key, error = %e, "Ignoring unreadable managed items annotation");
        ManagedItems::new()
    })
}

fn resolve_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('/').try_fold(value, |current, segment| {
        match segment.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            Some(name) => current
                .as_array_mut()?
                .iter_mut()
                .find(|item| item.get("name").and_then(Value::as_str) == Some(name)),
            None => current.get_mut(segment),
        }
    })
}

/// Remove what `previous` recorded and `current` no longer lists
pub fn prune_unmanaged(target: &mut Value, previous: &ManagedItems, current: &ManagedItems) {
    for (path, names) in previous {
        let stale: BTreeSet<&str> = names
            .iter()
            .filter(|name| current.get(path).is_none_or(|keep| !keep.contains(*name)))
            .map(String::as_str)
            .collect();
        if stale.is_empty() {
            continue;
        }
        match resolve_mut(target, path) {
            Some(Value::Array(items)) => items.retain(|item| {
                item.get("name")
                    .and_then(Value::as_str)
                    .is_none_or(|name| !stale.contains(name))
            }),
            Some(Value::Object(fields)) => fields.retain(|k, _| !stale.contains(k.as_str())),
            _ => {}
        }
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.get("name").is_some_and(Value::is_string))
}
