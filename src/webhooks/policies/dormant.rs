//! Resume provenance
//!
//! A create whose name matches a dormant record resumes that record's data,
//! so the proposed spec must be the retained origin spec. Only the governed
//! fields (credentials reference, termination policy, monitor, backup
//! schedule) may differ; everything else must match exactly.

use super::{ValidationContext, ValidationResult};
use crate::crd::{DormantPhase, MONGODB_KIND, MongoDBSpec};

pub const DORMANT_KIND_MISMATCH: &str = "DormantKindMismatch";
pub const SPEC_MISMATCH: &str = "IrrecoverableSpecMismatch";
pub const DORMANT_WIPING_OUT: &str = "DormantRecordWipingOut";

/// The origin spec with the governed fields taken from the proposed spec
pub fn fold_governed(origin: &MongoDBSpec, proposed: &MongoDBSpec) -> MongoDBSpec {
    MongoDBSpec {
        auth_secret: proposed.auth_secret.clone(),
        termination_policy: proposed.termination_policy,
        monitor: proposed.monitor.clone(),
        backup_schedule: proposed.backup_schedule.clone(),
        ..origin.clone()
    }
}

pub fn validate_dormant(ctx: &ValidationContext) -> ValidationResult {
    let Some(record) = ctx.dormant else {
        return ValidationResult::allowed();
    };

    if record.origin_kind() != Some(MONGODB_KIND) {
        return ValidationResult::denied(
            DORMANT_KIND_MISMATCH,
            &format!(
                "a dormant {} with this name exists; delete it or pick another name",
                record.origin_kind().unwrap_or("database of unknown kind")
            ),
        );
    }

    if record.spec.wipe_out || record.phase() == DormantPhase::WipedOut {
        return ValidationResult::denied(
            DORMANT_WIPING_OUT,
            "the dormant record with this name is being wiped out and cannot be resumed",
        );
    }

    let Some(origin) = record.spec.origin.spec.mongodb.as_ref() else {
        return ValidationResult::denied(
            DORMANT_KIND_MISMATCH,
            "the dormant record with this name retains no MongoDB spec",
        );
    };

    let proposed = &ctx.mongodb.spec;
    if &fold_governed(origin, proposed) != proposed {
        return ValidationResult::denied(
            SPEC_MISMATCH,
            "spec differs from the paused database it would resume; only authSecret, \
             terminationPolicy, monitor and backupSchedule may change",
        );
    }

    ValidationResult::allowed()
}
