//! Credential secrets of a database
//!
//! Credentials are generated once and never rewritten. They carry the
//! database labels but no owner reference, so pausing or halting a database
//! keeps them; only a wipe-out sweeps them, and only when nothing else still
//! references the secret by name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rand::Rng;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::{DormantDatabase, MongoDB};
use crate::resources::common::retained_meta;
use crate::store::{LabelSelector, Lookup, Propagation, Store, Verb};

pub const USER_KEY: &str = "user";
pub const PASSWORD_KEY: &str = "password";
pub const KEY_FILE_KEY: &str = "key.txt";

const ROOT_USER: &str = "root";

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

pub fn key_file_secret_name(name: &str) -> String {
    format!("{}-key", name)
}

/// Root credentials secret under the name the spec references
pub fn auth_secret(mongodb: &MongoDB) -> Secret {
    Secret {
        metadata: retained_meta(mongodb, mongodb.auth_secret_name()),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            (USER_KEY.to_string(), ROOT_USER.to_string()),
            (PASSWORD_KEY.to_string(), generate_password(16)),
        ])),
        ..Default::default()
    }
}

/// Shared key members of a replica set or sharded cluster authenticate with
pub fn key_file_secret(mongodb: &MongoDB) -> Secret {
    Secret {
        metadata: retained_meta(mongodb, key_file_secret_name(&mongodb.name_any())),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            KEY_FILE_KEY.to_string(),
            generate_password(756),
        )])),
        ..Default::default()
    }
}

async fn ensure_absent_then_create(store: &Store, namespace: &str, secret: Secret) -> Result<Verb> {
    let name = secret.name_any();
    if let Lookup::Found(_) = store.get::<Secret>(namespace, &name).await? {
        return Ok(Verb::Unchanged);
    }
    match store.create(&secret).await {
        Ok(_) => {
            info!(namespace = %namespace, secret = %name, "Created secret");
            Ok(Verb::Created)
        }
        Err(Error::AlreadyExists(_)) => Ok(Verb::Unchanged),
        Err(e) => Err(e),
    }
}

/// Create the credentials secret unless it already exists
pub async fn ensure_auth_secret(store: &Store, mongodb: &MongoDB) -> Result<Verb> {
    let namespace = mongodb.namespace().unwrap_or_default();
    ensure_absent_then_create(store, &namespace, auth_secret(mongodb)).await
}

pub async fn ensure_key_file_secret(store: &Store, mongodb: &MongoDB) -> Result<Verb> {
    let namespace = mongodb.namespace().unwrap_or_default();
    ensure_absent_then_create(store, &namespace, key_file_secret(mongodb)).await
}

/// Whether any database or dormant record other than `owner` still
/// references the secret `secret` in `namespace`.
///
/// A database that is itself being deleted still counts: its teardown may
/// end in a dormant record that needs the secret to resume.
pub async fn secret_in_use(
    store: &Store,
    namespace: &str,
    secret: &str,
    owner: &str,
) -> Result<bool> {
    let selector = LabelSelector::new();
    let live = store.list::<MongoDB>(Some(namespace), &selector).await?;
    let used_live = live
        .iter()
        .filter(|mg| mg.name_any() != owner)
        .any(|mg| mg.auth_secret_name() == secret);
    if used_live {
        return Ok(true);
    }

    let dormant = store.list::<DormantDatabase>(Some(namespace), &selector).await?;
    Ok(dormant
        .iter()
        .filter(|d| d.name_any() != owner)
        .filter_map(|d| d.spec.origin.spec.mongodb.as_ref().map(|spec| (d, spec)))
        .any(|(d, spec)| {
            let name = spec
                .auth_secret
                .as_ref()
                .map(|s| s.name.clone())
                .unwrap_or_else(|| crate::crd::default_auth_secret_name(&d.name_any()));
            name == secret
        }))
}

/// Delete the credentials of a wiped-out database.
///
/// The auth secret survives while another database or dormant record
/// references it. Returns the names actually deleted.
pub async fn sweep_secrets(
    store: &Store,
    namespace: &str,
    owner: &str,
    auth_secret: &str,
) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    if secret_in_use(store, namespace, auth_secret, owner).await? {
        info!(
            namespace = %namespace,
            secret = %auth_secret,
            "Credentials secret still referenced, keeping it"
        );
    } else if let Lookup::Found(()) = store
        .delete::<Secret>(namespace, auth_secret, Propagation::Background)
        .await?
    {
        deleted.push(auth_secret.to_string());
    }

    let key_file = key_file_secret_name(owner);
    if let Lookup::Found(()) = store
        .delete::<Secret>(namespace, &key_file, Propagation::Background)
        .await?
    {
        deleted.push(key_file);
    }

    debug!(namespace = %namespace, ?deleted, "Swept secrets");
    Ok(deleted)
}
