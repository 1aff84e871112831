//! Controller wiring
//!
//! MongoDB and DormantDatabase resources each run under a
//! [`kube::runtime::Controller`] fed from the store's watch streams through a
//! reflector. The controller never runs two reconciles of the same object at
//! once; failure counts kept on the [`Context`] turn repeated retryable errors
//! into a Stalled condition after `max_retries` attempts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, future};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::runtime::WatchStreamExt;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{self, ObjectRef, reflector};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::dormant::reconcile_dormant;
use crate::controller::error::{Error, Result};
use crate::controller::reconciler::reconcile;
use crate::controller::status::StatusManager;
use crate::crd::{DormantDatabase, LifecyclePhase, MongoDB};
use crate::store::{ObjectKey, Store, StoredResource, WatchEvent};

/// Resolve once the stop signal fired; never when the sender is gone
async fn stopped(mut stop: watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        future::pending::<()>().await;
    }
}

/// Fields whose change warrants a reconcile; status writes are ignored
fn fingerprint(value: &Value) -> String {
    let meta = &value["metadata"];
    json!([
        meta["generation"],
        meta["labels"],
        meta["annotations"],
        meta["deletionTimestamp"],
        meta["finalizers"],
        value["status"]["readyReplicas"],
    ])
    .to_string()
}

fn key_of<K: StoredResource + Resource>(obj: &K) -> ObjectKey {
    ObjectKey::new(K::KIND, &obj.namespace().unwrap_or_default(), &obj.name_any())
}

type Changes = BoxStream<'static, Result<WatchEvent>>;

enum Feed {
    Start,
    Listing(Changes),
    Live(Changes),
}

fn decode<K: StoredResource>(event: WatchEvent) -> Option<watcher::Event<K>> {
    let (value, deleted) = match event {
        WatchEvent::Applied(value) => (value, false),
        WatchEvent::Deleted(value) => (value, true),
    };
    match serde_json::from_value::<K>(value) {
        Ok(obj) if deleted => Some(watcher::Event::Delete(obj)),
        Ok(obj) => Some(watcher::Event::Apply(obj)),
        Err(e) => {
            warn!(kind = %K::KIND, error = %e, "Ignoring undecodable watch event");
            None
        }
    }
}

/// Watch events of one kind as a restartable watcher stream.
///
/// Every (re)start opens with an empty `Init`/`InitDone` pair, so a reflector
/// fed from it drops objects that vanished while the watch was down; the
/// listing that follows refills it.
pub fn watch_events<K>(
    store: Store,
    namespace: Option<String>,
    retry: Duration,
) -> BoxStream<'static, watcher::Result<watcher::Event<K>>>
where
    K: StoredResource + 'static,
{
    stream::unfold(Feed::Start, move |feed| {
        let store = store.clone();
        let namespace = namespace.clone();
        async move {
            let open = || store.client().watch(K::KIND, namespace.as_deref());
            match feed {
                Feed::Start => Some((Ok(watcher::Event::Init), Feed::Listing(open()))),
                Feed::Listing(changes) => Some((Ok(watcher::Event::InitDone), Feed::Live(changes))),
                Feed::Live(mut changes) => {
                    loop {
                        match changes.next().await {
                            Some(Ok(event)) => {
                                if let Some(event) = decode::<K>(event) {
                                    return Some((Ok(event), Feed::Live(changes)));
                                }
                            }
                            Some(Err(e)) => {
                                warn!(kind = %K::KIND, error = %e, "Watch failed, restarting");
                                break;
                            }
                            None => {
                                debug!(kind = %K::KIND, "Watch ended, restarting");
                                break;
                            }
                        }
                    }
                    tokio::time::sleep(retry).await;
                    Some((Ok(watcher::Event::Init), Feed::Listing(open())))
                }
            }
        }
    })
    .boxed()
}

/// Drop objects whose reconcile-relevant fields did not change since the
/// last time they were seen
pub fn changed_only<K, S>(objects: S) -> impl Stream<Item = watcher::Result<K>> + Send + 'static
where
    K: Resource + Serialize + Send + 'static,
    S: Stream<Item = watcher::Result<K>> + Send + 'static,
{
    let mut seen: HashMap<String, String> = HashMap::new();
    objects.filter(move |item| {
        let keep = match item {
            Ok(obj) => {
                let identity = format!(
                    "{}/{}/{}",
                    obj.namespace().unwrap_or_default(),
                    obj.name_any(),
                    obj.uid().unwrap_or_default()
                );
                let print = serde_json::to_value(obj)
                    .map(|value| fingerprint(&value))
                    .unwrap_or_default();
                seen.insert(identity, print.clone()).as_deref() != Some(print.as_str())
            }
            Err(_) => true,
        };
        future::ready(keep)
    })
}

async fn stall(mongodb: Option<&MongoDB>, ctx: &Context, e: &Error) {
    let Some(mongodb) = mongodb else {
        return;
    };
    let mut status = StatusManager::new(mongodb, ctx);
    if let Err(write) = status.set_stalled(&e.reason(), &e.to_string()).await {
        warn!(name = %mongodb.name_any(), error = %write, "Failed to record stalled condition");
    }
}

/// Account for a failed reconcile.
///
/// Returns the error when the controller should retry it, or the action to
/// take instead once retrying is pointless.
async fn settle_failure(
    key: &ObjectKey,
    mongodb: Option<&MongoDB>,
    ctx: &Context,
    e: Error,
) -> Result<Action> {
    if matches!(e, Error::Cancelled) {
        return Err(e);
    }

    if let Some(health) = &ctx.health {
        health
            .metrics
            .record_error(key.kind.as_str(), key.namespace_or_default(), &key.name);
    }

    if !e.is_retryable() {
        error!(key = %key, reason = %e.reason(), error = %e, "Reconcile failed permanently");
        stall(mongodb, ctx, &e).await;
        ctx.clear_failures(key);
        return Ok(Action::await_change());
    }

    let failures = ctx.record_failure(key);
    if failures > ctx.config.max_retries {
        warn!(key = %key, failures, error = %e, "Retries exhausted, waiting for the next change");
        stall(mongodb, ctx, &e).await;
        ctx.clear_failures(key);
        if let Some(health) = &ctx.health {
            health.metrics.retries_exhausted_total.inc();
        }
        return Ok(Action::await_change());
    }
    Err(e)
}

fn record_duration(ctx: &Context, key: &ObjectKey, start: Instant) {
    if let Some(health) = &ctx.health {
        health.metrics.record_reconcile(
            key.kind.as_str(),
            key.namespace_or_default(),
            &key.name,
            start.elapsed().as_secs_f64(),
        );
    }
}

/// Reconcile a MongoDB resource with failure accounting
pub async fn reconcile_mongodb(mongodb: Arc<MongoDB>, ctx: Arc<Context>) -> Result<Action> {
    let key = key_of(mongodb.as_ref());
    let start = Instant::now();
    let result = reconcile(Arc::clone(&mongodb), Arc::clone(&ctx)).await;
    record_duration(&ctx, &key, start);
    match result {
        Ok(action) => {
            ctx.clear_failures(&key);
            Ok(action)
        }
        Err(e) => settle_failure(&key, Some(&mongodb), &ctx, e).await,
    }
}

/// Reconcile a dormant record with failure accounting
pub async fn reconcile_dormant_record(
    record: Arc<DormantDatabase>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let key = key_of(record.as_ref());
    let start = Instant::now();
    let result = reconcile_dormant(record, Arc::clone(&ctx)).await;
    record_duration(&ctx, &key, start);
    match result {
        Ok(action) => {
            ctx.clear_failures(&key);
            Ok(action)
        }
        Err(e) => settle_failure(&key, None, &ctx, e).await,
    }
}

fn retry_action(key: &ObjectKey, error: &Error, ctx: &Context) -> Action {
    if matches!(error, Error::Cancelled) {
        debug!(key = %key, "Reconcile cancelled by shutdown");
        return Action::await_change();
    }
    let attempt = ctx.failures(key).saturating_sub(1);
    let delay = ctx.config.backoff.delay_for_attempt(attempt);
    warn!(key = %key, attempt = attempt + 1, ?delay, error = %error, "Reconcile failed, retrying");
    if let Some(health) = &ctx.health {
        health.metrics.requeues_total.inc();
    }
    Action::requeue(delay)
}

/// Error policy for MongoDB resources: exponential backoff per object
pub fn error_policy(mongodb: Arc<MongoDB>, error: &Error, ctx: Arc<Context>) -> Action {
    retry_action(&key_of(mongodb.as_ref()), error, &ctx)
}

/// Error policy for dormant records
pub fn dormant_error_policy(record: Arc<DormantDatabase>, error: &Error, ctx: Arc<Context>) -> Action {
    retry_action(&key_of(record.as_ref()), error, &ctx)
}

fn log_result<K: Resource>(
    result: std::result::Result<(ObjectRef<K>, Action), controller::Error<Error, watcher::Error>>,
) {
    match result {
        Ok((obj, _action)) => debug!("Reconciled: {}", obj.name),
        Err(controller::Error::ObjectNotFound(obj)) => {
            debug!("Object no longer exists (likely deleted): {}", obj.name);
        }
        // Already logged and counted by the error policy
        Err(controller::Error::ReconcilerFailed(e, obj)) => {
            debug!("Reconcile of {} failed: {}", obj.name, e);
        }
        Err(e) => error!("Controller error: {:?}", e),
    }
}

/// Refresh the phase gauge from the reflector cache
async fn report_phases(ctx: Arc<Context>, databases: reflector::Store<MongoDB>) {
    let Some(health) = ctx.health.clone() else {
        return;
    };
    let mut interval = tokio::time::interval(ctx.config.resync_period);
    loop {
        interval.tick().await;
        let mut by_phase: BTreeMap<String, i64> = LifecyclePhase::ALL
            .iter()
            .map(|phase| (phase.to_string(), 0))
            .collect();
        for mg in databases.state() {
            *by_phase.entry(mg.phase().to_string()).or_default() += 1;
        }
        for (phase, count) in &by_phase {
            health.metrics.set_databases_by_phase(phase, *count);
        }
    }
}

/// Run both controllers until `stop` fires
pub async fn run(ctx: Arc<Context>, stop: watch::Receiver<bool>) {
    let namespace = ctx.config.watch_namespace.clone();
    let retry = ctx.config.backoff.initial_delay;
    let concurrency = u16::try_from(ctx.config.workers.max(1)).unwrap_or(u16::MAX);
    info!(
        scope = namespace.as_deref().unwrap_or("cluster-wide"),
        concurrency,
        "Starting controllers"
    );

    let (databases, writer) = reflector::store::<MongoDB>();
    let mongodb_feed = reflector(
        writer,
        watch_events::<MongoDB>(ctx.store.clone(), namespace.clone(), retry),
    )
    .applied_objects();
    let statefulsets =
        watch_events::<StatefulSet>(ctx.store.clone(), namespace.clone(), retry).applied_objects();
    let deployments =
        watch_events::<Deployment>(ctx.store.clone(), namespace.clone(), retry).applied_objects();

    let mongodb_controller = Controller::for_stream(changed_only(mongodb_feed), databases.clone())
        .owns_stream(changed_only(statefulsets))
        .owns_stream(changed_only(deployments))
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile_mongodb, error_policy, Arc::clone(&ctx))
        .for_each(|result| async move { log_result(result) });

    let (records, writer) = reflector::store::<DormantDatabase>();
    let dormant_feed = reflector(
        writer,
        watch_events::<DormantDatabase>(ctx.store.clone(), namespace, retry),
    )
    .applied_objects();
    let dormant_controller = Controller::for_stream(changed_only(dormant_feed), records)
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile_dormant_record, dormant_error_policy, Arc::clone(&ctx))
        .for_each(|result| async move { log_result(result) });

    if let Some(health) = &ctx.health {
        health.set_ready(true);
    }

    tokio::select! {
        _ = stopped(stop) => info!("Stopping controllers"),
        _ = async {
            tokio::join!(
                mongodb_controller,
                dormant_controller,
                report_phases(Arc::clone(&ctx), databases),
            )
        } => error!("Controller stream ended unexpectedly"),
    }

    if let Some(health) = &ctx.health {
        health.set_ready(false);
    }
    info!("Controllers stopped");
}
