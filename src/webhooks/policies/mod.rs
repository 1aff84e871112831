//! Admission webhook policies
//!
//! Each policy module exports a `validate_*` function over a
//! [`ValidationContext`]. Policies are pure: every store read they depend on
//! is gathered up front into [`StoreFacts`] or the dormant record.

pub mod deletion;
pub mod dormant;
pub mod immutability;
pub mod references;
pub mod spec;

pub use deletion::validate_deletion;
pub use dormant::{fold_governed, validate_dormant};
pub use immutability::validate_immutability;
pub use references::validate_references;
pub use spec::validate_static;

use kube::Resource;
use kube::core::admission::Operation;

use crate::config::OperatorConfig;
use crate::controller::error::Error;
use crate::crd::{DormantDatabase, MongoDB};

/// Result of a policy validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

impl From<Error> for ValidationResult {
    fn from(e: Error) -> Self {
        let message = match &e {
            Error::RejectedByPolicy { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self::denied(&e.reason(), &message)
    }
}

/// Point-in-time answers about objects a spec references.
///
/// Facts for references the spec does not make default to `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreFacts {
    pub storage_class_exists: bool,
    pub auth_secret_exists: bool,
    pub backup_secret_exists: bool,
}

impl Default for StoreFacts {
    fn default() -> Self {
        Self {
            storage_class_exists: true,
            auth_secret_exists: true,
            backup_secret_exists: true,
        }
    }
}

/// Context for validation
///
/// For DELETE requests `mongodb` is the stored object being removed.
pub struct ValidationContext<'a> {
    pub mongodb: &'a MongoDB,
    pub old: Option<&'a MongoDB>,
    pub operation: Operation,
    pub dormant: Option<&'a DormantDatabase>,
    pub facts: StoreFacts,
    pub config: &'a OperatorConfig,
}

impl<'a> ValidationContext<'a> {
    pub fn new(mongodb: &'a MongoDB, operation: Operation, config: &'a OperatorConfig) -> Self {
        Self {
            mongodb,
            old: None,
            operation,
            dormant: None,
            facts: StoreFacts::default(),
            config,
        }
    }

    pub fn with_old(mut self, old: Option<&'a MongoDB>) -> Self {
        self.old = old;
        self
    }

    pub fn with_dormant(mut self, dormant: Option<&'a DormantDatabase>) -> Self {
        self.dormant = dormant;
        self
    }

    pub fn with_facts(mut self, facts: StoreFacts) -> Self {
        self.facts = facts;
        self
    }

    /// Whether an update leaves the spec as stored, like a finalizer or label edit
    pub fn is_metadata_only(&self) -> bool {
        self.old.is_some_and(|old| old.spec == self.mongodb.spec)
    }

    /// Whether the object already carries a deletion timestamp
    pub fn is_terminating(&self) -> bool {
        self.mongodb.meta().deletion_timestamp.is_some()
    }
}

/// Run the policies of the request's operation and return the first failure
pub fn validate_all(ctx: &ValidationContext) -> ValidationResult {
    let policies: Vec<fn(&ValidationContext) -> ValidationResult> = match ctx.operation {
        Operation::Create => vec![validate_static, validate_references, validate_dormant],
        // Spec rules bind new specs only; teardown must be able to release its finalizer
        Operation::Update if ctx.is_metadata_only() || ctx.is_terminating() => {
            vec![validate_immutability]
        }
        Operation::Update => vec![validate_static, validate_references, validate_immutability],
        Operation::Delete => vec![validate_deletion],
        Operation::Connect => vec![],
    };

    for policy in policies {
        let result = policy(ctx);
        if !result.allowed {
            return result;
        }
    }

    ValidationResult::allowed()
}
