//! Static spec invariants
//!
//! The same checks the reconciler repeats before acting on a spec.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_spec;

pub fn validate_static(ctx: &ValidationContext) -> ValidationResult {
    match validate_spec(&ctx.mongodb.spec, ctx.config) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => e.into(),
    }
}
