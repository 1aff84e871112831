//! Structured events emitted against database resources
//!
//! Events are best-effort: a failure to publish is logged and never fails
//! the reconcile that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter};
use parking_lot::Mutex;
use tracing::warn;

/// Name the operator reports events under
pub const REPORTER: &str = "mongodb-operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// One event about a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub type_: EventType,
    /// PascalCase reason code
    pub reason: String,
    pub message: String,
    /// What the operator was doing when it happened
    pub action: String,
}

impl Event {
    pub fn normal(reason: &str, action: &str, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason: reason.to_string(),
            message: message.into(),
            action: action.to_string(),
        }
    }

    pub fn warning(reason: &str, action: &str, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reason.to_string(),
            message: message.into(),
            action: action.to_string(),
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, object: &ObjectReference, event: Event);
}

/// Publishes through the Kubernetes events API
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, object: &ObjectReference, event: Event) {
        let kube_event = KubeEvent {
            type_: match event.type_ {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: event.action.clone(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&kube_event, object).await {
            warn!(reason = %event.reason, "Failed to publish event: {}", e);
        }
    }
}

/// Keeps events in memory for inspection
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<(String, Event)>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reason codes recorded for an object name, oldest first
    pub fn reasons_for(&self, name: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, e)| e.reason.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<(String, Event)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, object: &ObjectReference, event: Event) {
        let name = object.name.clone().unwrap_or_default();
        self.events.lock().push((name, event));
    }
}
