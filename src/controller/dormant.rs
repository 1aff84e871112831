//! Dormant records of paused databases
//!
//! A paused database leaves a [`DormantDatabase`] holding a deep copy of its
//! origin. Admission compares every re-create against that copy and disarms
//! the record on a match; the reconciler then deletes it here. An armed
//! record (`wipeOut=true`) is the only path to destroying retained data.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::Event;
use crate::controller::lifecycle::delete_volumes;
use crate::controller::reconciler::{
    FINALIZER, add_finalizer, has_finalizer, object_ref, release_finalizer,
};
use kube::runtime::controller::Action;
use crate::crd::{
    DormantDatabase, DormantDatabaseSpec, DormantDatabaseStatus, DormantPhase, LABEL_KIND,
    LABEL_NAME, MONGODB_KIND, MongoDB, Origin, OriginMeta, OriginSpec, default_auth_secret_name,
};
use crate::resources::secret;
use crate::store::{Lookup, Propagation};

/// Reason used when a create finds a record admission never disarmed
pub const NOT_DISARMED: &str = "DormantRecordNotDisarmed";

/// Dormant record retaining the origin of a database
pub fn dormant_record(mongodb: &MongoDB) -> DormantDatabase {
    let name = mongodb.name_any();
    let labels = BTreeMap::from([
        (LABEL_KIND.to_string(), MONGODB_KIND.to_string()),
        (LABEL_NAME.to_string(), name.clone()),
    ]);

    let origin = Origin {
        metadata: OriginMeta {
            name: name.clone(),
            namespace: mongodb.namespace(),
            labels: mongodb.labels().clone(),
            annotations: mongodb.annotations().clone(),
        },
        spec: OriginSpec {
            mongodb: Some(mongodb.spec.clone()),
        },
    };

    DormantDatabase {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: mongodb.namespace(),
            labels: Some(labels),
            finalizers: Some(vec![FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: DormantDatabaseSpec {
            origin,
            wipe_out: false,
        },
        status: None,
    }
}

/// Create the dormant record of a pausing database, or reuse the existing one
pub async fn ensure_dormant(ctx: &Context, mongodb: &MongoDB) -> Result<DormantDatabase> {
    let namespace = mongodb.namespace().unwrap_or_default();
    let name = mongodb.name_any();

    if let Lookup::Found(existing) = ctx.store.get::<DormantDatabase>(&namespace, &name).await? {
        debug!(namespace = %namespace, name = %name, "Reusing dormant record");
        return Ok(existing);
    }

    match ctx.store.create(&dormant_record(mongodb)).await {
        Ok(created) => {
            info!(namespace = %namespace, name = %name, "Created dormant record");
            Ok(created)
        }
        Err(Error::AlreadyExists(_)) => match ctx.store.get::<DormantDatabase>(&namespace, &name).await? {
            Lookup::Found(existing) => Ok(existing),
            Lookup::NotFound => Err(Error::TransientError(format!(
                "dormant record {}/{} vanished during creation",
                namespace, name
            ))),
        },
        Err(e) => Err(e),
    }
}

/// Record that the origin's workloads are fully gone
pub async fn mark_paused(ctx: &Context, namespace: &str, name: &str) -> Result<()> {
    let status = DormantDatabaseStatus {
        phase: DormantPhase::Paused,
        paused_time: Some(Utc::now().to_rfc3339()),
        ..Default::default()
    };
    match ctx
        .store
        .patch_status::<DormantDatabase>(namespace, name, &status)
        .await?
    {
        Lookup::Found(_) => Ok(()),
        Lookup::NotFound => Err(Error::NotFound(format!(
            "dormant record {}/{}",
            namespace, name
        ))),
    }
}

/// Delete the dormant record a re-created database resumes from.
///
/// Returns true when a disarmed record was consumed. A record still armed
/// means admission never approved this create.
pub async fn claim_dormant(ctx: &Context, mongodb: &MongoDB) -> Result<bool> {
    let namespace = mongodb.namespace().unwrap_or_default();
    let name = mongodb.name_any();

    let record = match ctx.store.get::<DormantDatabase>(&namespace, &name).await? {
        Lookup::Found(record) => record,
        Lookup::NotFound => return Ok(false),
    };

    if record.spec.wipe_out || has_finalizer(&record.metadata) {
        let message = format!(
            "dormant record {}/{} is still armed; admission was bypassed",
            namespace, name
        );
        warn!("{}", message);
        return Err(Error::rejected(NOT_DISARMED, message));
    }

    ctx.store
        .delete::<DormantDatabase>(&namespace, &name, Propagation::Background)
        .await?;
    info!(namespace = %namespace, name = %name, "Resumed from dormant record");
    ctx.publish(
        &object_ref(mongodb),
        Event::normal("Resumed", "Resume", "Consumed the dormant record"),
    )
    .await;
    Ok(true)
}

/// Credentials secret referenced by the record's origin
fn origin_auth_secret(record: &DormantDatabase) -> String {
    record
        .spec
        .origin
        .spec
        .mongodb
        .as_ref()
        .and_then(|spec| spec.auth_secret.as_ref())
        .map(|s| s.name.clone())
        .unwrap_or_else(|| default_auth_secret_name(&record.name_any()))
}

/// Destroy the retained volumes and credentials of a record
async fn wipe_out(ctx: &Context, record: &DormantDatabase) -> Result<()> {
    let namespace = record.namespace().unwrap_or_default();
    let name = record.name_any();

    delete_volumes(&ctx.store, &namespace, &name).await?;
    let swept =
        secret::sweep_secrets(&ctx.store, &namespace, &name, &origin_auth_secret(record)).await?;

    let status = DormantDatabaseStatus {
        phase: DormantPhase::WipedOut,
        paused_time: record.status.as_ref().and_then(|s| s.paused_time.clone()),
        wiped_out_time: Some(Utc::now().to_rfc3339()),
        observed_generation: record.metadata.generation,
    };
    ctx.store
        .patch_status::<DormantDatabase>(&namespace, &name, &status)
        .await?;
    info!(namespace = %namespace, name = %name, ?swept, "Wiped out dormant database");
    Ok(())
}

/// Reconcile a dormant record
#[instrument(skip(record, ctx), fields(name = %record.name_any(), namespace = record.namespace().unwrap_or_default()))]
pub async fn reconcile_dormant(record: Arc<DormantDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let armed = record.spec.wipe_out;

    if record.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&record.metadata) {
            if armed && record.phase() != DormantPhase::WipedOut {
                wipe_out(&ctx, &record).await?;
            }
            release_finalizer::<DormantDatabase>(
                &ctx.store,
                &record.namespace().unwrap_or_default(),
                &record.name_any(),
            )
            .await?;
        }
        return Ok(Action::await_change());
    }

    if armed {
        if !has_finalizer(&record.metadata) {
            // The wipe must finish before the record can disappear
            add_finalizer::<DormantDatabase>(&ctx.store, &record.metadata).await?;
        }
        if record.phase() != DormantPhase::WipedOut {
            wipe_out(&ctx, &record).await?;
        }
    }

    Ok(Action::await_change())
}
