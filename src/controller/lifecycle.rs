//! Teardown of a deleted MongoDB resource under its termination policy
//!
//! Every policy stops backups, deletes the workloads with foreground
//! propagation and waits until their pods are gone. `Pause` then hands the
//! origin to a dormant record, `Halt` keeps volumes and secrets without one,
//! and `WipeOut` also removes volumes and sweeps credentials nothing else
//! references. The finalizer is released last.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::controller::context::Context;
use crate::controller::dormant;
use crate::controller::error::{Error, Result};
use crate::controller::events::Event;
use crate::controller::reconciler::{
    FINALIZER, apply_transition, has_finalizer, object_ref, release_finalizer,
};
use crate::controller::state_machine::{LifecycleEvent, TransitionContext, teardown_event};
use crate::controller::status::StatusManager;
use kube::runtime::controller::Action;
use crate::crd::{LABEL_KIND, LABEL_NAME, LifecyclePhase, MongoDB, TerminationPolicy};
use crate::resources::backup::{self, BACKUP_ROLE};
use crate::resources::common::{KIND, LABEL_ROLE};
use crate::resources::init_job::RESTORE_ROLE;
use crate::resources::{monitor, secret};
use crate::resources::topology::plan_roles;
use crate::store::{LabelSelector, Propagation, Store};

/// Reason code for deletions the termination policy forbids
pub const DO_NOT_TERMINATE: &str = "TerminationPolicyDoNotTerminate";

/// Selector matching every object labelled for a database
pub fn database_selector(name: &str) -> LabelSelector {
    LabelSelector::from([
        (LABEL_KIND.to_string(), KIND.to_string()),
        (LABEL_NAME.to_string(), name.to_string()),
    ])
}

/// Names of the data pods of a database still present
pub async fn remaining_pods(store: &Store, namespace: &str, name: &str) -> Result<Vec<String>> {
    let pods = store
        .list::<Pod>(Some(namespace), &database_selector(name))
        .await?;
    Ok(pods
        .iter()
        .filter(|pod| {
            let role = pod.labels().get(LABEL_ROLE).map(String::as_str);
            role != Some(RESTORE_ROLE) && role != Some(BACKUP_ROLE)
        })
        .map(|pod| pod.name_any())
        .collect())
}

/// Delete every workload of the database with foreground propagation
pub async fn delete_workloads(store: &Store, mongodb: &MongoDB) -> Result<()> {
    let namespace = mongodb.namespace().unwrap_or_default();
    for role in plan_roles(mongodb) {
        if role.is_stateful() {
            store
                .delete::<StatefulSet>(&namespace, &role.workload, Propagation::Foreground)
                .await?;
        } else {
            store
                .delete::<Deployment>(&namespace, &role.workload, Propagation::Foreground)
                .await?;
        }
        debug!(workload = %role.workload, "Deleted workload");
    }
    Ok(())
}

/// Block until no data pod of the database is left, bounded by the init timeout
pub async fn wait_for_pods_gone(ctx: &Context, namespace: &str, name: &str) -> Result<()> {
    let deadline = Instant::now() + ctx.config.init_timeout;
    loop {
        let remaining = remaining_pods(&ctx.store, namespace, name).await?;
        if remaining.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::TransientError(format!(
                "pods still present after {:?}: {}",
                ctx.config.init_timeout,
                remaining.join(", ")
            )));
        }
        debug!(?remaining, "Waiting for pods to terminate");
        ctx.sleep_or_cancel(ctx.config.poll_interval.min(deadline - now))
            .await?;
    }
}

/// Delete the persistent volume claims of a database
pub async fn delete_volumes(store: &Store, namespace: &str, name: &str) -> Result<usize> {
    let claims = store
        .list::<PersistentVolumeClaim>(Some(namespace), &database_selector(name))
        .await?;
    for claim in &claims {
        store
            .delete::<PersistentVolumeClaim>(namespace, &claim.name_any(), Propagation::Background)
            .await?;
    }
    if !claims.is_empty() {
        info!(namespace = %namespace, count = claims.len(), "Deleted volume claims");
    }
    Ok(claims.len())
}

/// Run the teardown of a resource carrying a deletion timestamp
#[instrument(skip(mongodb, ctx), fields(name = %mongodb.name_any(), policy = %mongodb.spec.termination_policy))]
pub async fn handle_deletion(mongodb: &MongoDB, ctx: &Context) -> Result<Action> {
    if !has_finalizer(&mongodb.metadata) {
        return Ok(Action::await_change());
    }

    let policy = mongodb.spec.termination_policy;
    let namespace = mongodb.namespace().unwrap_or_default();
    let name = mongodb.name_any();
    let tctx = TransitionContext::new(policy);
    let mut status = StatusManager::new(mongodb, ctx);

    if policy == TerminationPolicy::DoNotTerminate {
        // Admission rejects these deletions; seeing one means it was bypassed
        let message = "termination policy DoNotTerminate forbids deletion; admission was bypassed";
        error!(namespace = %namespace, "{}", message);
        ctx.publish(
            &object_ref(mongodb),
            Event::warning(DO_NOT_TERMINATE, "Delete", message),
        )
        .await;
        return Err(Error::rejected(DO_NOT_TERMINATE, message));
    }

    if status.phase() != LifecyclePhase::Pausing {
        apply_transition(
            mongodb,
            ctx,
            &mut status,
            LifecycleEvent::DeletionRequested,
            &tctx,
            "Pausing",
            "Deletion requested, tearing down workloads",
        )
        .await?;
    }

    if policy == TerminationPolicy::Pause {
        dormant::ensure_dormant(ctx, mongodb).await?;
    }

    backup::remove_backup(&ctx.store, &namespace, &name).await?;
    monitor::remove_service_monitor(&ctx.store, mongodb).await?;
    delete_workloads(&ctx.store, mongodb).await?;
    wait_for_pods_gone(ctx, &namespace, &name).await?;

    let (reason, message) = match policy {
        TerminationPolicy::Pause => {
            dormant::mark_paused(ctx, &namespace, &name).await?;
            ("Paused", "Workloads removed, origin retained in the dormant record")
        }
        TerminationPolicy::Halt | TerminationPolicy::DoNotTerminate => {
            ("Halted", "Workloads removed, volumes and secrets kept")
        }
        TerminationPolicy::WipeOut => {
            delete_volumes(&ctx.store, &namespace, &name).await?;
            let swept =
                secret::sweep_secrets(&ctx.store, &namespace, &name, &mongodb.auth_secret_name())
                    .await?;
            debug!(?swept, "Swept credentials");
            ("WipedOut", "Workloads, volumes and credentials removed")
        }
    };

    apply_transition(
        mongodb,
        ctx,
        &mut status,
        teardown_event(policy),
        &tctx,
        reason,
        message,
    )
    .await?;

    release_finalizer::<MongoDB>(&ctx.store, &namespace, &name).await?;
    info!(finalizer = FINALIZER, "Teardown complete, released finalizer");
    Ok(Action::await_change())
}
