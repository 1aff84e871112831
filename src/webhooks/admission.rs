//! Admission pipeline for MongoDB resources
//!
//! Mutation and validation both work on the submitted object plus
//! point-in-time reads of the store. Any failure to read the store denies
//! the request. The only write is the disarming of a dormant record after a
//! create it resumes was approved.

use std::sync::Arc;

use kube::{Resource, ResourceExt};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use serde_json::json;
use tracing::{debug, info, warn};

use super::mutation::{default_mongodb, mutation_patch};
use super::policies::{StoreFacts, ValidationContext, ValidationResult, validate_all};
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::controller::reconciler::FINALIZER;
use crate::crd::{DormantDatabase, MongoDB, default_auth_secret_name};
use crate::health::HealthState;
use crate::store::{Lookup, ResourceKind, Store};

/// Reason attached when the store could not answer a lookup
pub const STORE_UNAVAILABLE: &str = "AdmissionStoreError";
/// Reason attached to requests without the object they need
pub const MISSING_OBJECT: &str = "MissingObject";

/// Outcome of one admission stage
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow { patch: Option<json_patch::Patch> },
    Deny { reason: String, message: String },
}

impl Decision {
    pub fn allow() -> Self {
        Decision::Allow { patch: None }
    }

    pub fn deny(reason: &str, message: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Allow { .. } => None,
            Decision::Deny { reason, .. } => Some(reason),
        }
    }

    pub fn patch(&self) -> Option<&json_patch::Patch> {
        match self {
            Decision::Allow { patch } => patch.as_ref(),
            Decision::Deny { .. } => None,
        }
    }

    /// Render the decision as a response to `request`
    pub fn into_response(self, request: &AdmissionRequest<MongoDB>) -> AdmissionResponse {
        match self {
            Decision::Allow { patch: None } => AdmissionResponse::from(request),
            Decision::Allow { patch: Some(patch) } => {
                match AdmissionResponse::from(request).with_patch(patch) {
                    Ok(response) => response,
                    Err(e) => denied(request, "InvalidPatch", &e.to_string()),
                }
            }
            Decision::Deny { reason, message } => denied(request, &reason, &message),
        }
    }
}

impl From<ValidationResult> for Decision {
    fn from(result: ValidationResult) -> Self {
        if result.allowed {
            return Decision::allow();
        }
        Decision::Deny {
            reason: result.reason.unwrap_or_else(|| "ValidationFailed".to_string()),
            message: result.message.unwrap_or_else(|| "Validation failed".to_string()),
        }
    }
}

fn denied(request: &AdmissionRequest<MongoDB>, reason: &str, message: &str) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = 403;
    response.result.reason = reason.to_string();
    response
}

fn operation_name(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}

#[derive(Clone)]
pub struct AdmissionPipeline {
    store: Store,
    config: Arc<OperatorConfig>,
    health: Option<Arc<HealthState>>,
}

impl AdmissionPipeline {
    pub fn new(store: Store, config: Arc<OperatorConfig>) -> Self {
        Self {
            store,
            config,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    fn record(&self, operation: &Operation, decision: &Decision) {
        if let Some(health) = &self.health {
            health.metrics.record_admission(
                operation_name(operation),
                decision.is_allowed(),
                decision.reason().unwrap_or("Allowed"),
            );
        }
    }

    async fn dormant_for(&self, namespace: &str, name: &str) -> Result<Option<DormantDatabase>> {
        Ok(self
            .store
            .get::<DormantDatabase>(namespace, name)
            .await?
            .into_option())
    }

    /// Existence of every object the spec references.
    ///
    /// On update only references that differ from `old` are looked up; one
    /// that vanished since it was admitted does not block later writes.
    async fn gather_facts(&self, mongodb: &MongoDB, old: Option<&MongoDB>) -> Result<StoreFacts> {
        let namespace = mongodb.namespace().unwrap_or_default();
        let spec = &mongodb.spec;
        let mut facts = StoreFacts::default();

        if let Some(class) = spec.storage.as_ref().and_then(|s| s.storage_class.as_deref())
            && old.is_none_or(|old| old.spec.storage != spec.storage)
        {
            facts.storage_class_exists =
                self.store.exists(ResourceKind::StorageClass, "", class).await?;
        }

        // The default secret is created lazily by the controller
        let auth_secret = mongodb.auth_secret_name();
        if auth_secret != default_auth_secret_name(&mongodb.name_any())
            && old.is_none_or(|old| old.auth_secret_name() != auth_secret)
        {
            facts.auth_secret_exists = self
                .store
                .exists(ResourceKind::Secret, &namespace, &auth_secret)
                .await?;
        }

        if let Some(schedule) = &spec.backup_schedule {
            let previous = old
                .and_then(|old| old.spec.backup_schedule.as_ref())
                .map(|b| b.storage_secret_name.as_str());
            if previous != Some(schedule.storage_secret_name.as_str()) {
                facts.backup_secret_exists = self
                    .store
                    .exists(ResourceKind::Secret, &namespace, &schedule.storage_secret_name)
                    .await?;
            }
        }

        Ok(facts)
    }

    /// Mark a resumed dormant record non-destructible and release its finalizer
    async fn disarm(&self, record: &DormantDatabase) -> Result<()> {
        let namespace = record.namespace().unwrap_or_default();
        let finalizers: Vec<String> = record
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        let mut patch = json!({
            "metadata": { "finalizers": finalizers },
            "spec": { "wipeOut": false }
        });
        if let Some(version) = &record.metadata.resource_version {
            patch["metadata"]["resourceVersion"] = json!(version);
        }
        match self
            .store
            .merge::<DormantDatabase>(&namespace, &record.name_any(), patch)
            .await?
        {
            Lookup::Found(_) => {
                info!(namespace = %namespace, name = %record.name_any(), "Disarmed dormant record");
                Ok(())
            }
            Lookup::NotFound => Err(Error::NotFound(format!(
                "dormant record {}/{}",
                namespace,
                record.name_any()
            ))),
        }
    }

    /// Defaulting stage
    pub async fn mutate(&self, request: &AdmissionRequest<MongoDB>) -> Decision {
        let decision = self.mutate_inner(request).await;
        self.record(&request.operation, &decision);
        decision
    }

    async fn mutate_inner(&self, request: &AdmissionRequest<MongoDB>) -> Decision {
        if request.sub_resource.is_some() {
            return Decision::allow();
        }
        if !matches!(request.operation, Operation::Create | Operation::Update) {
            return Decision::allow();
        }
        let Some(mongodb) = request.object.as_ref() else {
            return Decision::deny(MISSING_OBJECT, "request carries no object");
        };

        let dormant = if request.operation == Operation::Create {
            let namespace = request.namespace.clone().unwrap_or_default();
            match self.dormant_for(&namespace, &request.name).await {
                Ok(dormant) => dormant,
                Err(e) => {
                    warn!(uid = %request.uid, error = %e, "Dormant lookup failed, denying");
                    return Decision::deny(STORE_UNAVAILABLE, e.to_string());
                }
            }
        } else {
            None
        };

        let defaulted = default_mongodb(mongodb, dormant.as_ref(), &self.config);
        match mutation_patch(mongodb, &defaulted) {
            Ok(patch) if patch.0.is_empty() => Decision::allow(),
            Ok(patch) => {
                debug!(uid = %request.uid, operations = patch.0.len(), "Applying defaults");
                Decision::Allow { patch: Some(patch) }
            }
            Err(e) => Decision::deny("InvalidPatch", e.to_string()),
        }
    }

    /// Validation stage
    pub async fn validate(&self, request: &AdmissionRequest<MongoDB>) -> Decision {
        info!(
            uid = %request.uid,
            operation = operation_name(&request.operation),
            namespace = ?request.namespace,
            name = %request.name,
            "Processing admission request"
        );
        let decision = self.validate_inner(request).await;
        match &decision {
            Decision::Allow { .. } => info!(uid = %request.uid, "Admission request allowed"),
            Decision::Deny { reason, message } => {
                warn!(uid = %request.uid, reason = %reason, message = %message, "Admission request denied")
            }
        }
        self.record(&request.operation, &decision);
        decision
    }

    async fn validate_inner(&self, request: &AdmissionRequest<MongoDB>) -> Decision {
        // Status writes come from the controller itself
        if request.sub_resource.is_some() {
            return Decision::allow();
        }

        match request.operation {
            Operation::Delete => match request.old_object.as_ref() {
                Some(old) => {
                    let ctx = ValidationContext::new(old, Operation::Delete, &self.config);
                    validate_all(&ctx).into()
                }
                None => Decision::allow(),
            },
            Operation::Create | Operation::Update => {
                let Some(mongodb) = request.object.as_ref() else {
                    return Decision::deny(MISSING_OBJECT, "request carries no object");
                };
                match self.validate_write(request, mongodb).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!(uid = %request.uid, error = %e, "Store lookup failed, denying");
                        Decision::deny(STORE_UNAVAILABLE, e.to_string())
                    }
                }
            }
            Operation::Connect => Decision::allow(),
        }
    }

    async fn validate_write(
        &self,
        request: &AdmissionRequest<MongoDB>,
        mongodb: &MongoDB,
    ) -> Result<Decision> {
        let old = request.old_object.as_ref();
        let facts = if mongodb.meta().deletion_timestamp.is_some() {
            StoreFacts::default()
        } else {
            self.gather_facts(mongodb, old).await?
        };
        let is_create = request.operation == Operation::Create;
        let dormant = if is_create {
            let namespace = request.namespace.clone().unwrap_or_default();
            self.dormant_for(&namespace, &request.name).await?
        } else {
            None
        };

        let ctx = ValidationContext::new(mongodb, request.operation.clone(), &self.config)
            .with_old(old)
            .with_dormant(dormant.as_ref())
            .with_facts(facts);
        let result = validate_all(&ctx);
        if !result.allowed {
            return Ok(result.into());
        }

        if let Some(record) = &dormant {
            if !request.dry_run {
                self.disarm(record).await?;
            }
        }
        Ok(Decision::allow())
    }
}
