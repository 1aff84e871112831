use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::controller::events::{Event, EventSink};
use crate::controller::state_machine::LifecycleStateMachine;
use crate::health::HealthState;
use crate::store::{ObjectKey, Store};

/// Shared context for reconcilers
pub struct Context {
    pub store: Store,
    pub config: Arc<OperatorConfig>,
    pub events: Arc<dyn EventSink>,
    pub health: Option<Arc<HealthState>>,
    pub state_machine: LifecycleStateMachine,
    stop: watch::Receiver<bool>,
    /// Consecutive failed reconciles per object
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Context {
    pub fn new(
        store: Store,
        config: Arc<OperatorConfig>,
        events: Arc<dyn EventSink>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            events,
            health: None,
            state_machine: LifecycleStateMachine::new(),
            stop,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    /// Whether the stop signal fired
    pub fn is_cancelled(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep for `duration`, returning early with `Error::Cancelled` on stop
    pub async fn sleep_or_cancel(&self, duration: Duration) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut stop = self.stop.clone();
        let deadline = tokio::time::Instant::now() + duration;
        let stopped = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Ok(()),
            changed = stop.wait_for(|stopped| *stopped) => changed.is_ok(),
        };
        if stopped {
            return Err(Error::Cancelled);
        }
        // Sender gone, nobody can stop us any more
        tokio::time::sleep_until(deadline).await;
        Ok(())
    }

    /// Count one more failed reconcile of `key`, returning the new total
    pub fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Consecutive failed reconciles of `key`
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    pub fn clear_failures(&self, key: &ObjectKey) {
        self.failures.lock().remove(key);
    }

    pub async fn publish(&self, object: &ObjectReference, event: Event) {
        self.events.publish(object, event).await;
    }
}
