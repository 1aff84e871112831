//! Status and conditions management for MongoDB resources
//!
//! This module provides utilities for managing Kubernetes-style conditions
//! and updating the status subresource.

use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use tracing::debug;

use crate::controller::Context;
use crate::controller::error::Result;
use crate::crd::{Condition, LifecyclePhase, MongoDB, MongoDBStatus};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Database is materialized and serving
    pub const READY: &str = "Ready";
    /// Database is moving towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// Certificates, secrets and storage classes are present
    pub const DEPENDENCIES_READY: &str = "DependenciesReady";
    /// Initialization source was applied
    pub const INITIALIZED: &str = "Initialized";
    /// Retries are exhausted; the engine gave up until the next change
    pub const STALLED: &str = "Stalled";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

fn status_str(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    ///
    /// `lastTransitionTime` only moves when the status flips, so setting the
    /// same condition twice leaves the list unchanged.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn remove(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, status_str(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            status_str(is_progressing),
            reason,
            message,
        )
    }

    pub fn dependencies_ready(self, ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEPENDENCIES_READY,
            status_str(ready),
            reason,
            message,
        )
    }

    pub fn initialized(self, done: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::INITIALIZED, status_str(done), reason, message)
    }

    pub fn stalled(self, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::STALLED, condition_status::TRUE, reason, message)
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Status writer for one reconcile of a MongoDB resource.
///
/// Keeps the last written status so consecutive phase changes within a
/// reconcile build on each other. Writes that change nothing are skipped.
pub struct StatusManager<'a> {
    mongodb: &'a MongoDB,
    ctx: &'a Context,
    status: MongoDBStatus,
}

impl<'a> StatusManager<'a> {
    pub fn new(mongodb: &'a MongoDB, ctx: &'a Context) -> Self {
        Self {
            mongodb,
            ctx,
            status: mongodb.status.clone().unwrap_or_default(),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.status.phase
    }

    pub fn status(&self) -> &MongoDBStatus {
        &self.status
    }

    /// Write a full status object
    pub async fn update(&mut self, status: MongoDBStatus) -> Result<()> {
        if status == self.status {
            debug!(name = %self.mongodb.name_any(), "Status unchanged, skipping write");
            return Ok(());
        }
        let namespace = self.mongodb.namespace().unwrap_or_default();
        self.ctx
            .store
            .patch_status::<MongoDB>(&namespace, &self.mongodb.name_any(), &status)
            .await?;
        self.status = status;
        Ok(())
    }

    fn conditions(&self) -> ConditionBuilder {
        ConditionBuilder::from_existing(self.status.conditions.clone(), self.mongodb.metadata.generation)
    }

    /// Move to `phase`, deriving conditions from it
    pub async fn set_phase(
        &mut self,
        phase: LifecyclePhase,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let conditions = self.conditions();
        let conditions = match phase {
            LifecyclePhase::Pending => conditions,
            LifecyclePhase::Creating => conditions
                .ready(false, reason, message)
                .progressing(true, reason, message),
            LifecyclePhase::Initializing => conditions
                .ready(false, reason, message)
                .progressing(true, reason, message)
                .initialized(false, reason, message),
            LifecyclePhase::Running => conditions
                .ready(true, reason, message)
                .progressing(false, "Stable", "Database is running")
                .dependencies_ready(true, "DependenciesPresent", "All dependencies are present")
                .remove(condition_types::STALLED),
            LifecyclePhase::Failed => conditions
                .ready(false, reason, message)
                .progressing(false, reason, message),
            LifecyclePhase::Pausing => conditions
                .ready(false, reason, message)
                .progressing(true, reason, message),
            LifecyclePhase::Paused | LifecyclePhase::Halted | LifecyclePhase::WipedOut => {
                conditions
                    .ready(false, reason, message)
                    .progressing(false, reason, message)
            }
        };

        let status = MongoDBStatus {
            phase,
            creation_time: self.status.creation_time.clone().or_else(|| Some(now())),
            observed_generation: self.mongodb.metadata.generation,
            conditions: conditions.build(),
            materialized: self.status.materialized,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        };
        self.update(status).await
    }

    /// Record the outcome of the initialization source
    pub async fn set_initialized(&mut self, succeeded: bool, reason: &str, message: &str) -> Result<()> {
        let mut status = self.status.clone();
        status.conditions = self.conditions().initialized(succeeded, reason, message).build();
        self.update(status).await
    }

    /// Record that every child resource exists
    pub async fn set_materialized(&mut self) -> Result<()> {
        let mut status = self.status.clone();
        status.materialized = true;
        self.update(status).await
    }

    /// Keep the phase, mark a missing dependency
    pub async fn set_waiting(&mut self, reason: &str, message: &str) -> Result<()> {
        let mut status = self.status.clone();
        status.conditions = self
            .conditions()
            .dependencies_ready(false, reason, message)
            .ready(false, reason, message)
            .build();
        status.reason = Some(reason.to_string());
        status.message = Some(message.to_string());
        self.update(status).await
    }

    /// Keep the phase, surface that retries are exhausted
    pub async fn set_stalled(&mut self, reason: &str, message: &str) -> Result<()> {
        let mut status = self.status.clone();
        status.conditions = self.conditions().stalled(reason, message).build();
        status.reason = Some(reason.to_string());
        status.message = Some(message.to_string());
        self.update(status).await
    }
}

/// Check if the spec changed by comparing observed generation
pub fn spec_changed(mongodb: &MongoDB) -> bool {
    let current_generation = mongodb.metadata.generation;
    let observed_generation = mongodb.status.as_ref().and_then(|s| s.observed_generation);

    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current > observed,
        (Some(_), None) => true,
        _ => true,
    }
}
