//! Deletion policy
//!
//! `DoNotTerminate` databases cannot be deleted; every other termination
//! policy is carried out by the controller.

use super::{ValidationContext, ValidationResult};
use crate::controller::lifecycle::DO_NOT_TERMINATE;
use crate::crd::TerminationPolicy;

pub fn validate_deletion(ctx: &ValidationContext) -> ValidationResult {
    if ctx.mongodb.spec.termination_policy == TerminationPolicy::DoNotTerminate {
        return ValidationResult::denied(
            DO_NOT_TERMINATE,
            "terminationPolicy is DoNotTerminate. Set it to Pause, Halt or WipeOut before deleting.",
        );
    }
    ValidationResult::allowed()
}
