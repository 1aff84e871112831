//! Reconciliation logic for MongoDB resources
//!
//! Every pass reads the current declared spec, computes the full set of child
//! objects and ensures them. Lifecycle phases only move along transitions the
//! state machine accepts.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::dormant;
use crate::controller::error::{Error, Result};
use crate::controller::events::Event;
use crate::controller::initializer;
use crate::controller::lifecycle;
use crate::controller::state_machine::{
    LifecycleEvent, TransitionContext, TransitionResult, determine_event,
};
use crate::controller::status::{StatusManager, spec_changed};
use crate::controller::validation::validate_spec;
use kube::runtime::controller::Action;
use crate::crd::{LifecyclePhase, MongoDB};
use crate::resources::{backup, topology};
use crate::store::{Lookup, Store, StoredResource};

/// Finalizer blocking store-level deletion until teardown ran
pub const FINALIZER: &str = "mongodb-operator.smoketurner.com/finalizer";

/// Reason reported while workload members are not ready
pub const WAITING_FOR_PODS: &str = "WaitingForPods";

/// Check if the finalizer is present
pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == FINALIZER))
}

/// Write the finalizer list of an object, conditional on its resource version
async fn write_finalizers<K: StoredResource>(
    store: &Store,
    meta: &ObjectMeta,
    finalizers: Vec<String>,
) -> Result<()> {
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    let mut patch = json!({ "metadata": { "finalizers": finalizers } });
    if let Some(version) = &meta.resource_version {
        patch["metadata"]["resourceVersion"] = json!(version);
    }
    store.merge::<K>(&namespace, &name, patch).await?;
    Ok(())
}

/// Add the finalizer to an object
pub async fn add_finalizer<K: StoredResource>(store: &Store, meta: &ObjectMeta) -> Result<()> {
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    write_finalizers::<K>(store, meta, finalizers).await?;
    debug!(name = ?meta.name, "Added finalizer");
    Ok(())
}

/// Remove the finalizer from an object, keeping any others
pub async fn remove_finalizer<K: StoredResource>(store: &Store, meta: &ObjectMeta) -> Result<()> {
    let finalizers: Vec<String> = meta
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    write_finalizers::<K>(store, meta, finalizers).await?;
    debug!(name = ?meta.name, "Removed finalizer");
    Ok(())
}

/// Remove the finalizer from the latest version of an object.
///
/// Status writes made during teardown move the resource version on, so the
/// object is read again right before the conditional write.
pub async fn release_finalizer<K: StoredResource + Resource>(
    store: &Store,
    namespace: &str,
    name: &str,
) -> Result<()> {
    match store.get::<K>(namespace, name).await? {
        Lookup::Found(latest) => remove_finalizer::<K>(store, latest.meta()).await,
        Lookup::NotFound => Ok(()),
    }
}

/// Event target for a MongoDB resource
pub fn object_ref(mongodb: &MongoDB) -> ObjectReference {
    mongodb.object_ref(&())
}

/// Apply a lifecycle event and persist the resulting phase.
///
/// Returns the new phase, or `None` when the table rejected the move.
pub(crate) async fn apply_transition(
    mongodb: &MongoDB,
    ctx: &Context,
    status: &mut StatusManager<'_>,
    event: LifecycleEvent,
    tctx: &TransitionContext,
    reason: &str,
    message: &str,
) -> Result<Option<LifecyclePhase>> {
    let current = status.phase();
    match ctx.state_machine.transition(current, event, tctx) {
        TransitionResult::Success {
            from,
            to,
            description,
            ..
        } => {
            info!(
                name = %mongodb.name_any(),
                from = %from,
                to = %to,
                event = %event,
                "{}",
                description
            );
            status.set_phase(to, reason, message).await?;
            ctx.publish(&object_ref(mongodb), Event::normal(reason, "Transition", message))
                .await;
            Ok(Some(to))
        }
        TransitionResult::GuardFailed { reason: guard, .. } => {
            debug!(name = %mongodb.name_any(), event = %event, "Transition guard failed: {}", guard);
            Ok(None)
        }
        TransitionResult::InvalidTransition { current, event } => {
            warn!(
                name = %mongodb.name_any(),
                phase = %current,
                event = %event,
                "No transition for event in current phase"
            );
            Ok(None)
        }
    }
}

/// Main reconciliation function
#[instrument(skip(mongodb, ctx), fields(name = %mongodb.name_any(), namespace = mongodb.namespace().unwrap_or_default()))]
pub async fn reconcile(mongodb: Arc<MongoDB>, ctx: Arc<Context>) -> Result<Action> {
    if mongodb.meta().deletion_timestamp.is_some() {
        return lifecycle::handle_deletion(&mongodb, &ctx).await;
    }

    let mut status = StatusManager::new(&mongodb, &ctx);
    let phase = status.phase();
    debug!(phase = %phase, "Reconciling MongoDB");

    if matches!(
        phase,
        LifecyclePhase::Pausing
            | LifecyclePhase::Paused
            | LifecyclePhase::Halted
            | LifecyclePhase::WipedOut
    ) {
        // Only a deletion leads here; nothing to do until it shows up
        return Ok(Action::await_change());
    }

    if !has_finalizer(mongodb.meta()) {
        add_finalizer::<MongoDB>(&ctx.store, mongodb.meta()).await?;
    }

    let tctx = TransitionContext::new(mongodb.spec.termination_policy)
        .with_init_pending(mongodb.init_pending())
        .with_spec_changed(spec_changed(&mongodb));

    match phase {
        LifecyclePhase::Pending => {
            let resuming = dormant::claim_dormant(&ctx, &mongodb).await?;
            if let Some(event) = determine_event(phase, &tctx, false, resuming) {
                let (reason, message) = if resuming {
                    ("Resumed", "Resuming from the dormant record")
                } else {
                    ("Creating", "Materializing child resources")
                };
                apply_transition(&mongodb, &ctx, &mut status, event, &tctx, reason, message)
                    .await?;
            }
        }
        LifecyclePhase::Failed => {
            match determine_event(phase, &tctx, false, false) {
                Some(event) => {
                    apply_transition(
                        &mongodb,
                        &ctx,
                        &mut status,
                        event,
                        &tctx,
                        "SpecChanged",
                        "Spec changed after a failure, retrying",
                    )
                    .await?;
                }
                None => {
                    debug!("Failed resource waits for a spec change");
                    return Ok(Action::await_change());
                }
            }
        }
        _ => {}
    }

    // Admission already enforced these; a violation here means it was bypassed
    if let Err(e) = validate_spec(&mongodb.spec, &ctx.config) {
        error!(
            error = %e,
            "Spec violates an admission invariant; admission was bypassed, refusing to reconcile"
        );
        ctx.publish(
            &object_ref(&mongodb),
            Event::warning(&e.reason(), "Validate", e.to_string()),
        )
        .await;
        return Err(e);
    }

    reconcile_topology(&mongodb, &ctx, &mut status, &tctx).await
}

async fn reconcile_topology(
    mongodb: &MongoDB,
    ctx: &Context,
    status: &mut StatusManager<'_>,
    tctx: &TransitionContext,
) -> Result<Action> {
    if let Err(e) = topology::materialize(ctx, mongodb).await {
        if let Error::DependencyNotReady { reason, message } = &e {
            warn!(reason = %reason, "{}", message);
            status.set_waiting(reason, message).await?;
            ctx.publish(&object_ref(mongodb), Event::warning(reason, "Materialize", message.clone()))
                .await;
        }
        return Err(e);
    }
    if !status.status().materialized {
        status.set_materialized().await?;
    }

    let unready = topology::unready_workloads(ctx, mongodb).await?;
    if !unready.is_empty() {
        let message = format!("waiting for ready members of {}", unready.join(", "));
        debug!("{}", message);
        if status.phase() == LifecyclePhase::Creating {
            status
                .set_phase(LifecyclePhase::Creating, WAITING_FOR_PODS, &message)
                .await?;
        }
        return Ok(Action::requeue(ctx.config.poll_interval));
    }

    match status.phase() {
        LifecyclePhase::Creating => {
            let event = determine_event(LifecyclePhase::Creating, tctx, false, false);
            match event {
                Some(LifecycleEvent::InitRequired) => {
                    initializer::initialize(ctx, mongodb, status).await?;
                }
                Some(event) => {
                    apply_transition(
                        mongodb,
                        ctx,
                        status,
                        event,
                        tctx,
                        "Running",
                        "All child resources materialized",
                    )
                    .await?;
                }
                None => {}
            }
        }
        // A previous pass stopped while the initialization source was applied
        LifecyclePhase::Initializing => {
            initializer::initialize(ctx, mongodb, status).await?;
        }
        LifecyclePhase::Running => {
            if spec_changed(mongodb) {
                status
                    .set_phase(LifecyclePhase::Running, "Running", "All child resources materialized")
                    .await?;
            }
        }
        _ => {}
    }

    if status.phase() == LifecyclePhase::Running {
        backup::ensure_backup(&ctx.store, mongodb, &ctx.config).await?;
        // Periodic pass repairs drift in children nobody watches
        return Ok(Action::requeue(ctx.config.resync_period));
    }

    Ok(Action::await_change())
}
