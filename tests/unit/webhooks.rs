//! Unit tests for the admission pipeline
//!
//! Requests are built the way the API server sends them and decided against
//! the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ObjectMeta;
use mongodb_operator::controller::Error;
use mongodb_operator::controller::dormant::dormant_record;
use mongodb_operator::controller::lifecycle::DO_NOT_TERMINATE;
use mongodb_operator::controller::reconciler::has_finalizer;
use mongodb_operator::controller::validation::reasons;
use mongodb_operator::crd::{
    INITIALIZED_ANNOTATION, LifecyclePhase, MongoDB, ShardTopology, Topology,
};
use mongodb_operator::store::{
    LabelSelector, Lookup, ObjectKey, Propagation, ResourceKind, ResourceStoreClient, Store,
    StorePatch, WatchEvent,
};
use mongodb_operator::webhooks::admission::STORE_UNAVAILABLE;
use mongodb_operator::webhooks::policies::dormant::{DORMANT_WIPING_OUT, SPEC_MISMATCH};
use mongodb_operator::webhooks::policies::references::{
    AUTH_SECRET_NOT_FOUND, BACKUP_STORAGE_NOT_FOUND, STORAGE_CLASS_NOT_FOUND,
};
use mongodb_operator::webhooks::{AdmissionPipeline, Decision};
use mongodb_operator::{FINALIZER, OperatorConfig};
use serde_json::{Value, json};

use crate::common::*;

const NS: &str = "db";

/// Operations of a mutation patch keyed by path
fn patch_ops(decision: &Decision) -> Vec<Value> {
    match decision.patch() {
        Some(patch) => serde_json::to_value(patch)
            .unwrap()
            .as_array()
            .cloned()
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

fn op_at<'a>(ops: &'a [Value], path: &str) -> Option<&'a Value> {
    ops.iter().find(|op| op["path"] == path)
}

async fn store_record(h: &Harness, origin: &MongoDB) {
    h.store.create(&dormant_record(origin)).await.unwrap();
}

mod mutation_tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_replicas_and_credentials() {
        let h = Harness::new();
        let mg = create_test_mongodb("mg", NS);
        let decision = h.pipeline().mutate(&create_request(&mg)).await;
        assert!(decision.is_allowed());

        let ops = patch_ops(&decision);
        assert_eq!(op_at(&ops, "/spec/replicas").unwrap()["value"], json!(1));
        assert_eq!(
            op_at(&ops, "/spec/authSecret").unwrap()["value"],
            json!({ "name": "mg-auth" })
        );
    }

    #[tokio::test]
    async fn test_defaulted_object_needs_no_patch() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_replicas(1)
            .with_auth_secret("mg-auth")
            .build();
        let decision = h.pipeline().mutate(&create_request(&mg)).await;
        assert_eq!(decision, Decision::allow());
    }

    #[tokio::test]
    async fn test_sharded_replicas_left_alone() {
        let h = Harness::new();
        let mg = create_test_sharded("sh", NS);
        let decision = h.pipeline().mutate(&create_request(&mg)).await;
        let ops = patch_ops(&decision);
        assert!(op_at(&ops, "/spec/replicas").is_none());
    }

    #[tokio::test]
    async fn test_monitor_port_defaulted() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_builtin_monitor().build();
        let decision = h.pipeline().mutate(&create_request(&mg)).await;
        let ops = patch_ops(&decision);
        let monitor = ops
            .iter()
            .find(|op| op["path"].as_str().unwrap().starts_with("/spec/monitor"))
            .unwrap();
        assert!(monitor.to_string().contains("56790"));
    }

    #[tokio::test]
    async fn test_resume_adopts_credentials_and_init_marker() {
        let h = Harness::new();
        let mut paused = MongoDBBuilder::new("mg", NS)
            .with_auth_secret("custom-auth")
            .with_init_script("init")
            .with_annotation(INITIALIZED_ANNOTATION, "")
            .build();
        paused.spec.replicas = Some(1);
        store_record(&h, &paused).await;

        let resumed = MongoDBBuilder::new("mg", NS).with_init_script("init").build();
        let decision = h.pipeline().mutate(&create_request(&resumed)).await;
        let ops = patch_ops(&decision);
        assert_eq!(
            op_at(&ops, "/spec/authSecret").unwrap()["value"],
            json!({ "name": "custom-auth" })
        );
        assert!(
            ops.iter()
                .any(|op| op["path"].as_str().unwrap().starts_with("/metadata/annotations"))
        );
    }

    #[tokio::test]
    async fn test_update_never_adopts() {
        let h = Harness::new();
        let paused = MongoDBBuilder::new("mg", NS)
            .with_auth_secret("custom-auth")
            .build();
        store_record(&h, &paused).await;

        let old = create_test_mongodb("mg", NS);
        let new = old.clone();
        let decision = h.pipeline().mutate(&update_request(&old, &new)).await;
        let ops = patch_ops(&decision);
        assert_eq!(
            op_at(&ops, "/spec/authSecret").unwrap()["value"],
            json!({ "name": "mg-auth" })
        );
    }

    #[tokio::test]
    async fn test_force_standalone_replicas() {
        let h = Harness::with_config(OperatorConfig {
            force_standalone_replicas: true,
            ..test_config()
        });
        let mg = MongoDBBuilder::new("mg", NS).with_replicas(3).build();
        let decision = h.pipeline().mutate(&create_request(&mg)).await;
        let ops = patch_ops(&decision);
        assert_eq!(op_at(&ops, "/spec/replicas").unwrap()["value"], json!(1));
    }
}

mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_valid_create_allowed() {
        let h = Harness::new();
        let decision = h
            .pipeline()
            .validate(&create_request(&create_test_mongodb("mg", NS)))
            .await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_unsupported_version_denied() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_version("2.6").build();
        let decision = h.pipeline().validate(&create_request(&mg)).await;
        assert_eq!(decision.reason(), Some(reasons::UNSUPPORTED_VERSION));
    }

    #[tokio::test]
    async fn test_cluster_auth_requires_tls() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_replica_set("rs0", 3)
            .with_cluster_auth_mode("x509")
            .build();
        let decision = h.pipeline().validate(&create_request(&mg)).await;
        assert_eq!(decision.reason(), Some(reasons::CLUSTER_AUTH_REQUIRES_TLS));
    }

    #[tokio::test]
    async fn test_storage_class_must_exist() {
        let h = Harness::new();
        let mg = create_test_replica_set("rs", NS);
        let decision = h.pipeline().validate(&create_request(&mg)).await;
        assert_eq!(decision.reason(), Some(STORAGE_CLASS_NOT_FOUND));

        let class = StorageClass {
            metadata: ObjectMeta {
                name: Some("standard".to_string()),
                ..Default::default()
            },
            provisioner: "kubernetes.io/no-provisioner".to_string(),
            ..Default::default()
        };
        h.store.create(&class).await.unwrap();
        let decision = h.pipeline().validate(&create_request(&mg)).await;
        assert!(decision.is_allowed(), "{:?}", decision);
    }

    #[tokio::test]
    async fn test_explicit_auth_secret_must_exist() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_auth_secret("external").build();
        let decision = h.pipeline().validate(&create_request(&mg)).await;
        assert_eq!(decision.reason(), Some(AUTH_SECRET_NOT_FOUND));

        h.add_secret(NS, "external").await;
        assert!(h.pipeline().validate(&create_request(&mg)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_default_auth_secret_need_not_exist() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_auth_secret("mg-auth").build();
        assert!(h.pipeline().validate(&create_request(&mg)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_backup_storage_must_exist() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_backup_schedule("0 2 * * *", "backup-creds")
            .build();
        let decision = h.pipeline().validate(&create_request(&mg)).await;
        assert_eq!(decision.reason(), Some(BACKUP_STORAGE_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_invalid_backup_schedule_denied() {
        let h = Harness::new();
        h.add_secret(NS, "backup-creds").await;
        let mg = MongoDBBuilder::new("mg", NS)
            .with_backup_schedule("every night", "backup-creds")
            .build();
        let decision = h.pipeline().validate(&create_request(&mg)).await;
        assert_eq!(decision.reason(), Some(reasons::INVALID_BACKUP_SCHEDULE));
    }

    #[tokio::test]
    async fn test_topology_change_denied() {
        let h = Harness::new();
        let old = MongoDBBuilder::new("mg", NS).with_replica_set("rs0", 3).build();
        let new = MongoDBBuilder::new("mg", NS).with_replica_set("rs1", 3).build();
        let decision = h.pipeline().validate(&update_request(&old, &new)).await;
        assert_eq!(decision.reason(), Some(reasons::TOPOLOGY_IMMUTABLE));

        let sharded = MongoDBBuilder::new("mg", NS).with_shards(2, 3, 3, 1).build();
        let decision = h.pipeline().validate(&update_request(&old, &sharded)).await;
        assert_eq!(decision.reason(), Some(reasons::TOPOLOGY_IMMUTABLE));
    }

    #[tokio::test]
    async fn test_storage_change_denied() {
        let h = Harness::new();
        let old = MongoDBBuilder::new("mg", NS).with_storage("1Gi", None).build();
        let new = MongoDBBuilder::new("mg", NS).with_storage("2Gi", None).build();
        let decision = h.pipeline().validate(&update_request(&old, &new)).await;
        assert_eq!(decision.reason(), Some(reasons::STORAGE_IMMUTABLE));
    }

    #[tokio::test]
    async fn test_replica_change_allowed() {
        let h = Harness::new();
        let old = MongoDBBuilder::new("mg", NS).with_replica_set("rs0", 3).build();
        let new = MongoDBBuilder::new("mg", NS).with_replica_set("rs0", 5).build();
        assert!(h.pipeline().validate(&update_request(&old, &new)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_init_fixed_once_attempted() {
        let h = Harness::new();
        let old = MongoDBBuilder::new("mg", NS)
            .with_init_script("a")
            .with_annotation(INITIALIZED_ANNOTATION, "")
            .build();
        let new = MongoDBBuilder::new("mg", NS)
            .with_init_script("b")
            .with_annotation(INITIALIZED_ANNOTATION, "")
            .build();
        let decision = h.pipeline().validate(&update_request(&old, &new)).await;
        assert_eq!(decision.reason(), Some(reasons::INIT_IMMUTABLE));
    }

    #[tokio::test]
    async fn test_do_not_terminate_deletion_denied() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_termination_policy("DoNotTerminate")
            .build();
        let request = delete_request(&mg);
        let decision = h.pipeline().validate(&request).await;
        assert_eq!(decision.reason(), Some(DO_NOT_TERMINATE));

        let response = decision.into_response(&request);
        assert!(!response.allowed);
        assert_eq!(response.result.code, 403);
        assert_eq!(response.result.reason, DO_NOT_TERMINATE);
    }

    #[tokio::test]
    async fn test_other_policies_may_delete() {
        let h = Harness::new();
        for policy in ["Pause", "Halt", "WipeOut"] {
            let mg = MongoDBBuilder::new("mg", NS)
                .with_termination_policy(policy)
                .build();
            assert!(h.pipeline().validate(&delete_request(&mg)).await.is_allowed());
        }
    }
}

mod update_tests {
    use super::*;

    fn with_topology(mg: &MongoDB, edit: impl FnOnce(&mut ShardTopology)) -> MongoDB {
        let mut changed = mg.clone();
        if let Topology::Sharded(shard) = &mut changed.spec.topology {
            edit(shard);
        }
        changed
    }

    #[tokio::test]
    async fn test_shard_layout_fixed_once_children_exist() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("sh", NS)
            .with_shards(3, 3, 3, 2)
            .with_storage("10Gi", None)
            .build();
        h.create(&mg).await;

        // Nothing was written for it yet, so the layout may still move
        let pending = h.get(NS, "sh").await.unwrap();
        let fewer = with_topology(&pending, |s| s.shards = 2);
        assert!(h.pipeline().validate(&update_request(&pending, &fewer)).await.is_allowed());

        h.reconcile(NS, "sh").await.unwrap();
        let creating = h.get(NS, "sh").await.unwrap();
        assert_eq!(creating.phase(), LifecyclePhase::Creating);

        let fewer = with_topology(&creating, |s| s.shards = 2);
        let decision = h.pipeline().validate(&update_request(&creating, &fewer)).await;
        assert_eq!(decision.reason(), Some(reasons::SHARD_TOPOLOGY_IMMUTABLE));
    }

    #[tokio::test]
    async fn test_running_shard_prefix_and_members_fixed() {
        let h = Harness::new();
        let running = h.run_to_running(&create_test_sharded("sh", NS)).await;
        assert_eq!(running.phase(), LifecyclePhase::Running);

        let renamed = with_topology(&running, |s| s.prefix = "part".to_string());
        let decision = h.pipeline().validate(&update_request(&running, &renamed)).await;
        assert_eq!(decision.reason(), Some(reasons::SHARD_TOPOLOGY_IMMUTABLE));

        let wider = with_topology(&running, |s| s.shard_replicas = 5);
        let decision = h.pipeline().validate(&update_request(&running, &wider)).await;
        assert_eq!(decision.reason(), Some(reasons::SHARD_TOPOLOGY_IMMUTABLE));
    }

    #[tokio::test]
    async fn test_running_cluster_accepts_credentials_and_monitor_changes() {
        let h = Harness::new();
        let running = h.run_to_running(&create_test_sharded("sh", NS)).await;

        h.add_secret(NS, "external").await;
        let mut rotated = running.clone();
        rotated.spec = MongoDBBuilder::new("sh", NS)
            .with_shards(2, 3, 3, 2)
            .with_storage("10Gi", None)
            .with_auth_secret("external")
            .spec();
        let decision = h.pipeline().validate(&update_request(&running, &rotated)).await;
        assert!(decision.is_allowed(), "{:?}", decision);

        let mut monitored = running.clone();
        monitored.spec = MongoDBBuilder::new("sh", NS)
            .with_shards(2, 3, 3, 2)
            .with_storage("10Gi", None)
            .with_builtin_monitor()
            .spec();
        let decision = h.pipeline().validate(&update_request(&running, &monitored)).await;
        assert!(decision.is_allowed(), "{:?}", decision);
    }

    #[tokio::test]
    async fn test_finalizer_release_allowed_after_secret_removed() {
        let h = Harness::new();
        // The credentials secret is already gone
        let mut old = MongoDBBuilder::new("mg", NS)
            .with_termination_policy("WipeOut")
            .with_auth_secret("mine")
            .build();
        old.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        old.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let mut released = old.clone();
        released.metadata.finalizers = None;

        let decision = h.pipeline().validate(&update_request(&old, &released)).await;
        assert!(decision.is_allowed(), "{:?}", decision);
    }

    #[tokio::test]
    async fn test_unchanged_reference_not_rechecked() {
        let h = Harness::new();
        let old = MongoDBBuilder::new("mg", NS)
            .with_replica_set("rs0", 3)
            .with_auth_secret("mine")
            .build();

        let scaled = MongoDBBuilder::new("mg", NS)
            .with_replica_set("rs0", 5)
            .with_auth_secret("mine")
            .build();
        assert!(h.pipeline().validate(&update_request(&old, &scaled)).await.is_allowed());

        let repointed = MongoDBBuilder::new("mg", NS)
            .with_replica_set("rs0", 3)
            .with_auth_secret("other")
            .build();
        let decision = h.pipeline().validate(&update_request(&old, &repointed)).await;
        assert_eq!(decision.reason(), Some(AUTH_SECRET_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_metadata_edit_allowed_on_retired_version() {
        let h = Harness::with_config(OperatorConfig {
            supported_versions: vec!["4.4".to_string()],
            ..test_config()
        });
        let old = create_test_mongodb("mg", NS);
        let labelled = MongoDBBuilder::new("mg", NS).with_label("team", "data").build();
        let decision = h.pipeline().validate(&update_request(&old, &labelled)).await;
        assert!(decision.is_allowed(), "{:?}", decision);

        // Any spec change is held to the current rules
        let scaled = MongoDBBuilder::new("mg", NS).with_replicas(1).build();
        let decision = h.pipeline().validate(&update_request(&old, &scaled)).await;
        assert_eq!(decision.reason(), Some(reasons::UNSUPPORTED_VERSION));
    }
}

mod resume_tests {
    use super::*;

    fn paused_origin() -> MongoDB {
        MongoDBBuilder::new("mg", NS)
            .with_replica_set("rs0", 3)
            .with_storage("1Gi", None)
            .build()
    }

    #[tokio::test]
    async fn test_matching_create_disarms_record() {
        let h = Harness::new();
        store_record(&h, &paused_origin()).await;

        let decision = h.pipeline().validate(&create_request(&paused_origin())).await;
        assert!(decision.is_allowed());

        let record = h.get_dormant(NS, "mg").await.unwrap();
        assert!(!has_finalizer(&record.metadata));
        assert!(!record.spec.wipe_out);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_record_armed() {
        let h = Harness::new();
        store_record(&h, &paused_origin()).await;

        let request = admission_request("CREATE", Some(&paused_origin()), None, true);
        assert!(h.pipeline().validate(&request).await.is_allowed());

        let record = h.get_dormant(NS, "mg").await.unwrap();
        assert!(has_finalizer(&record.metadata));
    }

    #[tokio::test]
    async fn test_changed_version_denied() {
        let h = Harness::new();
        store_record(&h, &paused_origin()).await;

        let mut resumed = paused_origin();
        resumed.spec.version = "4.4".to_string();
        let decision = h.pipeline().validate(&create_request(&resumed)).await;
        assert_eq!(decision.reason(), Some(SPEC_MISMATCH));

        // A denied resume leaves the record armed
        let record = h.get_dormant(NS, "mg").await.unwrap();
        assert!(has_finalizer(&record.metadata));
    }

    #[tokio::test]
    async fn test_governed_fields_may_differ() {
        let h = Harness::new();
        store_record(&h, &paused_origin()).await;

        let resumed = MongoDBBuilder::new("mg", NS)
            .with_replica_set("rs0", 3)
            .with_storage("1Gi", None)
            .with_termination_policy("WipeOut")
            .with_builtin_monitor()
            .build();
        assert!(h.pipeline().validate(&create_request(&resumed)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_wiping_record_blocks_resume() {
        let h = Harness::new();
        let mut record = dormant_record(&paused_origin());
        record.spec.wipe_out = true;
        h.store.create(&record).await.unwrap();

        let decision = h.pipeline().validate(&create_request(&paused_origin())).await;
        assert_eq!(decision.reason(), Some(DORMANT_WIPING_OUT));
    }
}

mod store_failure_tests {
    use super::*;

    /// Store whose every call fails
    struct FailingStore;

    fn unavailable() -> Error {
        Error::TransientError("store unavailable".to_string())
    }

    #[async_trait]
    impl ResourceStoreClient for FailingStore {
        async fn get(&self, _key: &ObjectKey) -> mongodb_operator::Result<Lookup<Value>> {
            Err(unavailable())
        }

        async fn list(
            &self,
            _kind: ResourceKind,
            _namespace: Option<&str>,
            _selector: &LabelSelector,
        ) -> mongodb_operator::Result<Vec<Value>> {
            Err(unavailable())
        }

        async fn create(&self, _kind: ResourceKind, _object: Value) -> mongodb_operator::Result<Value> {
            Err(unavailable())
        }

        async fn patch(
            &self,
            _key: &ObjectKey,
            _patch: &StorePatch,
        ) -> mongodb_operator::Result<Lookup<Value>> {
            Err(unavailable())
        }

        async fn patch_status(
            &self,
            _key: &ObjectKey,
            _patch: &Value,
        ) -> mongodb_operator::Result<Lookup<Value>> {
            Err(unavailable())
        }

        async fn delete(
            &self,
            _key: &ObjectKey,
            _propagation: Propagation,
        ) -> mongodb_operator::Result<Lookup<()>> {
            Err(unavailable())
        }

        fn watch(
            &self,
            _kind: ResourceKind,
            _namespace: Option<&str>,
        ) -> BoxStream<'static, mongodb_operator::Result<WatchEvent>> {
            stream::once(async { Err(unavailable()) }).boxed()
        }
    }

    fn failing_pipeline() -> AdmissionPipeline {
        AdmissionPipeline::new(Store::new(Arc::new(FailingStore)), Arc::new(test_config()))
    }

    #[tokio::test]
    async fn test_validation_fails_closed() {
        let decision = failing_pipeline()
            .validate(&create_request(&create_test_mongodb("mg", NS)))
            .await;
        assert_eq!(decision.reason(), Some(STORE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_mutation_fails_closed() {
        let decision = failing_pipeline()
            .mutate(&create_request(&create_test_mongodb("mg", NS)))
            .await;
        assert_eq!(decision.reason(), Some(STORE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_deletion_needs_no_store() {
        let decision = failing_pipeline()
            .validate(&delete_request(&create_test_mongodb("mg", NS)))
            .await;
        assert!(decision.is_allowed());
    }
}
