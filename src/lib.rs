pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod store;
pub mod webhooks;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, Result, reconcile, reconcile_dormant,
};
pub use crd::{DormantDatabase, MongoDB};
pub use health::{HealthState, Metrics};
pub use webhooks::{AdmissionPipeline, WebhookError, run_webhook_server};

use std::sync::Arc;

use kube::Client;
use tokio::sync::watch;

use controller::KubeEventSink;
use store::{KindRegistry, KubeStore, Store};

/// Store backed by the API server for every kind the operator touches
pub fn kube_store(client: Client) -> Store {
    Store::new(Arc::new(KubeStore::new(
        client,
        Arc::new(KindRegistry::standard()),
    )))
}

/// Run the controllers until `stop` fires.
///
/// Watches MongoDB and DormantDatabase resources plus the workloads they
/// own, scoped to `config.watch_namespace` when set. If `health_state` is
/// provided, readiness and metrics are reported through it.
pub async fn run_controller(
    client: Client,
    config: Arc<OperatorConfig>,
    health_state: Option<Arc<HealthState>>,
    stop: watch::Receiver<bool>,
) {
    let instance = hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string());
    let events = Arc::new(KubeEventSink::new(client.clone(), instance));

    let mut ctx = Context::new(kube_store(client), config, events, stop.clone());
    if let Some(state) = health_state {
        ctx = ctx.with_health(state);
    }

    controller::run(Arc::new(ctx), stop).await;
}
