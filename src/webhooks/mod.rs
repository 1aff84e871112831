//! Admission webhooks for MongoDB resources
//!
//! Requests pass two stages:
//! - Mutation: fill defaults, adopting credentials from a dormant record on resume
//! - Validation: static spec rules, referenced objects, immutability, resume
//!   provenance and deletion policy

pub mod admission;
pub mod mutation;
pub mod policies;
mod server;

pub use admission::{AdmissionPipeline, Decision};
pub use mutation::{default_mongodb, mutation_patch};
pub use policies::{StoreFacts, ValidationContext, ValidationResult};
pub use server::{WebhookError, run_webhook_server};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
