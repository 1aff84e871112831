//! Restore job applying a snapshot before the database runs
//!
//! The job payload is opaque to the operator: only its terminal status is
//! read back.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use tracing::info;

use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{MongoDB, SnapshotSource};
use crate::resources::common::{owned_meta, role_labels};
use crate::store::{Lookup, Store};

/// Role label value of restore job pods
pub const RESTORE_ROLE: &str = "restore";

pub fn restore_job_name(name: &str) -> String {
    format!("{}-restore", name)
}

/// Terminal state of a batch job as the operator sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
}

/// Read the outcome from job status counters
pub fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = &job.status else {
        return JobOutcome::Running;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return JobOutcome::Succeeded;
    }
    let failed = status
        .conditions
        .as_ref()
        .is_some_and(|c| c.iter().any(|c| c.type_ == "Failed" && c.status == "True"));
    if failed {
        JobOutcome::Failed
    } else {
        JobOutcome::Running
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Job restoring `snapshot` into the database
pub fn restore_job(mongodb: &MongoDB, snapshot: &SnapshotSource, config: &OperatorConfig) -> Job {
    let name = mongodb.name_any();
    let labels = role_labels(&name, RESTORE_ROLE);
    let snapshot_namespace = snapshot
        .namespace
        .clone()
        .or_else(|| mongodb.namespace())
        .unwrap_or_default();

    let container = Container {
        name: RESTORE_ROLE.to_string(),
        image: Some(config.images.tools(&mongodb.spec.version)),
        args: Some(vec![
            "--process=restore".to_string(),
            format!("--host={}", name),
            format!("--snapshot={}", snapshot.name),
            format!("--snapshot-namespace={}", snapshot_namespace),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "auth".to_string(),
                mount_path: "/srv/mongodb/secrets".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "storage".to_string(),
                mount_path: "/etc/storage".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    Job {
        metadata: owned_meta(mongodb, restore_job_name(&name), labels.clone()),
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![
                        secret_volume("auth", &mongodb.auth_secret_name()),
                        secret_volume("storage", &snapshot.name),
                    ]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the restore job unless it exists, returning the live job
pub async fn ensure_restore_job(
    store: &Store,
    mongodb: &MongoDB,
    snapshot: &SnapshotSource,
    config: &OperatorConfig,
) -> Result<Job> {
    let namespace = mongodb.namespace().unwrap_or_default();
    let name = restore_job_name(&mongodb.name_any());
    if let Lookup::Found(job) = store.get::<Job>(&namespace, &name).await? {
        return Ok(job);
    }
    let job = store.create(&restore_job(mongodb, snapshot, config)).await?;
    info!(namespace = %namespace, job = %name, snapshot = %snapshot.name, "Created restore job");
    Ok(job)
}

/// Current outcome of the restore job of a database
pub async fn restore_outcome(store: &Store, mongodb: &MongoDB) -> Result<JobOutcome> {
    let namespace = mongodb.namespace().unwrap_or_default();
    let name = restore_job_name(&mongodb.name_any());
    match store.get::<Job>(&namespace, &name).await? {
        Lookup::Found(job) => Ok(job_outcome(&job)),
        Lookup::NotFound => Err(Error::NotFound(format!("job {}/{}", namespace, name))),
    }
}
