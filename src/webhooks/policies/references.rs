//! Referenced objects must exist
//!
//! - The storage class of a persistent database
//! - An explicitly named credentials secret (the default one is created lazily)
//! - The storage secret of a backup schedule

use super::{ValidationContext, ValidationResult};

pub const STORAGE_CLASS_NOT_FOUND: &str = "StorageClassNotFound";
pub const AUTH_SECRET_NOT_FOUND: &str = "AuthSecretNotFound";
pub const BACKUP_STORAGE_NOT_FOUND: &str = "BackupStorageNotFound";

pub fn validate_references(ctx: &ValidationContext) -> ValidationResult {
    let spec = &ctx.mongodb.spec;

    if !ctx.facts.storage_class_exists {
        let class = spec
            .storage
            .as_ref()
            .and_then(|s| s.storage_class.as_deref())
            .unwrap_or_default();
        return ValidationResult::denied(
            STORAGE_CLASS_NOT_FOUND,
            &format!("storage class {:?} does not exist", class),
        );
    }

    if !ctx.facts.auth_secret_exists {
        return ValidationResult::denied(
            AUTH_SECRET_NOT_FOUND,
            &format!(
                "credentials secret {:?} does not exist",
                ctx.mongodb.auth_secret_name()
            ),
        );
    }

    if !ctx.facts.backup_secret_exists {
        let secret = spec
            .backup_schedule
            .as_ref()
            .map(|b| b.storage_secret_name.as_str())
            .unwrap_or_default();
        return ValidationResult::denied(
            BACKUP_STORAGE_NOT_FOUND,
            &format!("backup storage secret {:?} does not exist", secret),
        );
    }

    ValidationResult::allowed()
}
