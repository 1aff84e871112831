//! Immutability policies
//!
//! - Topology mode and replica set name never change
//! - Shard prefix and shard replica counts are fixed once materialized
//! - Storage never changes
//! - `spec.init` is fixed once initialization was attempted

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_spec_change;

pub fn validate_immutability(ctx: &ValidationContext) -> ValidationResult {
    // Only apply immutability checks on UPDATE, not CREATE
    let Some(old) = ctx.old else {
        return ValidationResult::allowed();
    };

    match validate_spec_change(old, ctx.mongodb) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => e.into(),
    }
}
