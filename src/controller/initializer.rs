//! One-time initialization of a freshly materialized database
//!
//! The initialized annotation is written before anything runs. Its presence
//! only says an attempt was made: a failed or timed-out attempt is never
//! repeated, even after the spec changes.

use kube::ResourceExt;
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::Event;
use crate::controller::reconciler::{apply_transition, object_ref};
use crate::controller::state_machine::{LifecycleEvent, TransitionContext};
use crate::controller::status::StatusManager;
use crate::crd::{INITIALIZED_ANNOTATION, LifecyclePhase, MongoDB};
use crate::resources::init_job::{self, JobOutcome};

/// How an initialization attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl InitOutcome {
    fn event(self) -> LifecycleEvent {
        match self {
            InitOutcome::Succeeded => LifecycleEvent::InitSucceeded,
            InitOutcome::Failed => LifecycleEvent::InitFailed,
            InitOutcome::TimedOut => LifecycleEvent::InitTimedOut,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            InitOutcome::Succeeded => "Initialized",
            InitOutcome::Failed => "InitializationFailed",
            InitOutcome::TimedOut => "InitializationTimeout",
        }
    }
}

/// Mark the resource as initialized; presence is all that matters
async fn mark_initialized(ctx: &Context, mongodb: &MongoDB) -> Result<()> {
    let namespace = mongodb.namespace().unwrap_or_default();
    let patch = json!({ "metadata": { "annotations": { INITIALIZED_ANNOTATION: "" } } });
    ctx.store
        .merge::<MongoDB>(&namespace, &mongodb.name_any(), patch)
        .await?;
    Ok(())
}

/// Poll the restore job until it terminates or the bound elapses
async fn wait_for_restore(ctx: &Context, mongodb: &MongoDB) -> Result<InitOutcome> {
    let deadline = Instant::now() + ctx.config.init_timeout;
    loop {
        match init_job::restore_outcome(&ctx.store, mongodb).await? {
            JobOutcome::Succeeded => return Ok(InitOutcome::Succeeded),
            JobOutcome::Failed => return Ok(InitOutcome::Failed),
            JobOutcome::Running => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(InitOutcome::TimedOut);
        }
        ctx.sleep_or_cancel(ctx.config.poll_interval.min(deadline - now))
            .await?;
    }
}

/// Apply the declared initialization source and move to Running or Failed.
///
/// Blocks the calling worker while a restore job runs, up to the configured
/// initialization timeout.
#[instrument(skip(ctx, mongodb, status), fields(name = %mongodb.name_any()))]
pub async fn initialize(
    ctx: &Context,
    mongodb: &MongoDB,
    status: &mut StatusManager<'_>,
) -> Result<InitOutcome> {
    let tctx = TransitionContext::new(mongodb.spec.termination_policy).with_init_pending(true);

    if status.phase() == LifecyclePhase::Creating {
        apply_transition(
            mongodb,
            ctx,
            status,
            LifecycleEvent::InitRequired,
            &tctx,
            "Initializing",
            "Applying initialization source",
        )
        .await?;
    }
    if !mongodb.is_initialized() {
        mark_initialized(ctx, mongodb).await?;
    }

    let snapshot = mongodb
        .spec
        .init
        .as_ref()
        .and_then(|init| init.snapshot_source.as_ref());

    let outcome = match snapshot {
        Some(snapshot) => {
            init_job::ensure_restore_job(&ctx.store, mongodb, snapshot, &ctx.config).await?;
            match wait_for_restore(ctx, mongodb).await {
                Ok(outcome) => outcome,
                Err(Error::NotFound(msg)) => {
                    warn!("Restore job disappeared: {}", msg);
                    InitOutcome::Failed
                }
                Err(e) => return Err(e),
            }
        }
        // Scripts run from the mounted volume when the server first starts
        None => InitOutcome::Succeeded,
    };

    let message = match outcome {
        InitOutcome::Succeeded => "Initialization source applied".to_string(),
        InitOutcome::Failed => "Restore job failed".to_string(),
        InitOutcome::TimedOut => format!(
            "Restore job did not finish within {:?}",
            ctx.config.init_timeout
        ),
    };

    let succeeded = outcome == InitOutcome::Succeeded;
    apply_transition(
        mongodb,
        ctx,
        status,
        outcome.event(),
        &tctx,
        outcome.reason(),
        &message,
    )
    .await?;
    status
        .set_initialized(succeeded, outcome.reason(), &message)
        .await?;

    if succeeded {
        info!("Initialization completed");
    } else {
        warn!(reason = outcome.reason(), "{}", message);
        ctx.publish(
            &object_ref(mongodb),
            Event::warning(outcome.reason(), "Initialize", message),
        )
        .await;
    }
    Ok(outcome)
}
