//! Scheduled backups of a running database
//!
//! A CronJob runs the tools image against the data service on the declared
//! schedule. Its payload is opaque; the operator only creates, updates and
//! removes it as the lifecycle demands.

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, PodSpec, PodTemplateSpec, SecretEnvSource, SecretVolumeSource,
    Volume, VolumeMount,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use tracing::info;

use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::crd::{BackupScheduleSpec, MongoDB};
use crate::resources::common::{owned_meta, role_labels};
use crate::store::{Lookup, Propagation, Store, Verb, create_or_patch};

/// Role label value of backup job pods
pub const BACKUP_ROLE: &str = "backup";

pub fn backup_cronjob_name(name: &str) -> String {
    format!("{}-backup", name)
}

/// CronJob running the declared backup schedule
pub fn backup_cronjob(
    mongodb: &MongoDB,
    schedule: &BackupScheduleSpec,
    config: &OperatorConfig,
) -> CronJob {
    let name = mongodb.name_any();
    let labels = role_labels(&name, BACKUP_ROLE);

    let mut args = vec!["--process=backup".to_string(), format!("--host={}", name)];
    if let Some(bucket) = &schedule.bucket {
        args.push(format!("--bucket={}", bucket));
    }

    let container = Container {
        name: BACKUP_ROLE.to_string(),
        image: Some(config.images.tools(&mongodb.spec.version)),
        args: Some(args),
        env_from: Some(vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: schedule.storage_secret_name.clone(),
                optional: Some(false),
            }),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "auth".to_string(),
            mount_path: "/srv/mongodb/secrets".to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    CronJob {
        metadata: owned_meta(mongodb, backup_cronjob_name(&name), labels.clone()),
        spec: Some(CronJobSpec {
            schedule: schedule.cron_expression.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![container],
                            volumes: Some(vec![Volume {
                                name: "auth".to_string(),
                                secret: Some(SecretVolumeSource {
                                    secret_name: Some(mongodb.auth_secret_name()),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }]),
                            restart_policy: Some("OnFailure".to_string()),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Bring the backup CronJob in line with the declared schedule.
///
/// Returns the verb of the write, `Unchanged` when there is nothing to do.
pub async fn ensure_backup(store: &Store, mongodb: &MongoDB, config: &OperatorConfig) -> Result<Verb> {
    match &mongodb.spec.backup_schedule {
        Some(schedule) => create_or_patch(store, &backup_cronjob(mongodb, schedule, config)).await,
        None => {
            let namespace = mongodb.namespace().unwrap_or_default();
            if remove_backup(store, &namespace, &mongodb.name_any()).await? {
                Ok(Verb::Patched)
            } else {
                Ok(Verb::Unchanged)
            }
        }
    }
}

/// Delete the backup CronJob of a database; true when one existed
pub async fn remove_backup(store: &Store, namespace: &str, name: &str) -> Result<bool> {
    let cronjob = backup_cronjob_name(name);
    match store
        .delete::<CronJob>(namespace, &cronjob, Propagation::Background)
        .await?
    {
        Lookup::Found(()) => {
            info!(namespace = %namespace, cronjob = %cronjob, "Stopped backup schedule");
            Ok(true)
        }
        Lookup::NotFound => Ok(false),
    }
}
