//! Lifecycle scenarios driven through the reconcilers against the memory store

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use mongodb_operator::FINALIZER;
use mongodb_operator::controller::{Action, Error};
use mongodb_operator::controller::dormant::NOT_DISARMED;
use mongodb_operator::controller::lifecycle::DO_NOT_TERMINATE;
use mongodb_operator::controller::reconciler::WAITING_FOR_PODS;
use mongodb_operator::controller::status::{condition_status, condition_types, find_condition};
use mongodb_operator::crd::{
    DormantPhase, INITIALIZED_ANNOTATION, LifecyclePhase, MongoDB, ServiceMonitor,
};
use mongodb_operator::resources::certificate::{WAITING_ON_CERTIFICATES, required_secrets};
use mongodb_operator::resources::init_job::restore_job_name;
use mongodb_operator::resources::monitor::SERVICE_MONITOR_ANNOTATION;
use mongodb_operator::resources::plan_roles;
use mongodb_operator::resources::workload::EXPORTER_PORT_NAME;
use mongodb_operator::store::{ObjectKey, ResourceKind};
use serde_json::json;

use crate::common::*;

const NS: &str = "db";

fn phase(mg: &MongoDB) -> LifecyclePhase {
    mg.phase()
}

fn condition_status_of(mg: &MongoDB, type_: &str) -> Option<String> {
    mg.status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, type_))
        .map(|c| c.status.clone())
}

async fn count_in(h: &Harness, kind: ResourceKind) -> usize {
    h.memory.count(kind)
}

mod creation_tests {
    use super::*;

    #[tokio::test]
    async fn test_standalone_waits_for_members_then_runs() {
        let h = Harness::new();
        let mg = create_test_mongodb("mg", NS);
        h.create(&mg).await;

        let action = h.reconcile(NS, "mg").await.unwrap();
        assert_eq!(action, Action::requeue(h.config.poll_interval));

        let current = h.get(NS, "mg").await.unwrap();
        assert_eq!(phase(&current), LifecyclePhase::Creating);
        assert_eq!(
            current.status.as_ref().unwrap().reason.as_deref(),
            Some(WAITING_FOR_PODS)
        );
        assert!(current.finalizers().contains(&FINALIZER.to_string()));

        let store = &h.store;
        assert!(store.get::<StatefulSet>(NS, "mg").await.unwrap().is_found());
        assert!(store.get::<Service>(NS, "mg").await.unwrap().is_found());
        assert!(
            store
                .get::<Service>(NS, &h.config.governing_service)
                .await
                .unwrap()
                .is_found()
        );
        assert!(h.secret_exists(NS, "mg-auth").await);
        assert!(!h.secret_exists(NS, "mg-key").await);

        h.mark_ready(&current).await;
        let action = h.reconcile(NS, "mg").await.unwrap();
        assert_eq!(action, Action::requeue(h.config.resync_period));

        let running = h.get(NS, "mg").await.unwrap();
        assert_eq!(phase(&running), LifecyclePhase::Running);
        assert_eq!(
            condition_status_of(&running, condition_types::READY).as_deref(),
            Some(condition_status::TRUE)
        );
        let reasons = h.events.reasons_for("mg");
        assert!(reasons.contains(&"Creating".to_string()));
        assert!(reasons.contains(&"Running".to_string()));
    }

    #[tokio::test]
    async fn test_removed_monitor_prunes_exporter_but_keeps_user_sidecar() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_builtin_monitor().build();
        h.run_to_running(&mg).await;

        // A sidecar injected by someone else
        let sts = h.store.get::<StatefulSet>(NS, "mg").await.unwrap().into_option().unwrap();
        let mut containers = serde_json::to_value(&sts.spec.unwrap().template.spec.unwrap().containers)
            .unwrap();
        containers
            .as_array_mut()
            .unwrap()
            .push(json!({ "name": "log-shipper", "image": "busybox" }));
        h.store
            .merge::<StatefulSet>(NS, "mg", json!({ "spec": { "template": { "spec": { "containers": containers } } } }))
            .await
            .unwrap();

        h.store
            .merge::<MongoDB>(NS, "mg", json!({ "spec": { "monitor": null } }))
            .await
            .unwrap();
        h.reconcile(NS, "mg").await.unwrap();

        let sts = h.store.get::<StatefulSet>(NS, "mg").await.unwrap().into_option().unwrap();
        let names: Vec<String> = sts
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .containers
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["mongodb".to_string(), "log-shipper".to_string()]);

        let service = h.store.get::<Service>(NS, "mg").await.unwrap().into_option().unwrap();
        let ports: Vec<String> = service
            .spec.clone()
            .unwrap()
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.name)
            .collect();
        assert!(!ports.contains(&EXPORTER_PORT_NAME.to_string()), "{:?}", ports);
        assert!(!service.annotations().contains_key("prometheus.io/scrape"));
    }

    #[tokio::test]
    async fn test_running_database_reconciles_without_writes() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_replica_set("rs0", 3)
            .with_storage("10Gi", Some("standard"))
            .with_builtin_monitor()
            .build();
        let running = h.run_to_running(&mg).await;
        assert_eq!(phase(&running), LifecyclePhase::Running);

        let before = h.memory.writes_excluding(&[]);
        for _ in 0..3 {
            h.reconcile(NS, "mg").await.unwrap();
        }
        assert_eq!(h.memory.writes_excluding(&[]), before);
    }

    #[tokio::test]
    async fn test_replica_set_gets_shared_key_file() {
        let h = Harness::new();
        h.create(&create_test_replica_set("rs", NS)).await;
        h.reconcile(NS, "rs").await.unwrap();

        assert!(h.secret_exists(NS, "rs-auth").await);
        assert!(h.secret_exists(NS, "rs-key").await);
        let sts = h
            .store
            .get::<StatefulSet>(NS, "rs")
            .await
            .unwrap()
            .into_option()
            .unwrap();
        assert_eq!(sts.spec.unwrap().replicas, Some(3));
    }

    #[tokio::test]
    async fn test_sharded_cluster_materializes_every_role() {
        let h = Harness::new();
        let mg = create_test_sharded("sh", NS);
        h.create(&mg).await;
        h.reconcile(NS, "sh").await.unwrap();

        for workload in ["sh-shard0", "sh-shard1", "sh-configsvr"] {
            assert!(
                h.store.get::<StatefulSet>(NS, workload).await.unwrap().is_found(),
                "missing {}",
                workload
            );
        }
        assert!(h.store.get::<Deployment>(NS, "sh-mongos").await.unwrap().is_found());
        assert_eq!(count_in(&h, ResourceKind::StatefulSet).await, 3);

        let current = h.get(NS, "sh").await.unwrap();
        h.mark_ready(&current).await;
        h.reconcile(NS, "sh").await.unwrap();
        assert_eq!(phase(&h.get(NS, "sh").await.unwrap()), LifecyclePhase::Running);
    }

    #[tokio::test]
    async fn test_partially_ready_cluster_keeps_creating() {
        let h = Harness::new();
        let mg = create_test_sharded("sh", NS);
        h.create(&mg).await;
        h.reconcile(NS, "sh").await.unwrap();

        // Only the first shard reports ready members
        h.store
            .patch_status::<StatefulSet>(NS, "sh-shard0", &json!({ "replicas": 3, "readyReplicas": 3 }))
            .await
            .unwrap();
        let action = h.reconcile(NS, "sh").await.unwrap();
        assert_eq!(action, Action::requeue(h.config.poll_interval));

        let current = h.get(NS, "sh").await.unwrap();
        assert_eq!(phase(&current), LifecyclePhase::Creating);
        let message = current.status.unwrap().message.unwrap();
        assert!(message.contains("sh-shard1"));
        assert!(!message.contains("sh-shard0"));
    }

    #[tokio::test]
    async fn test_tls_waits_for_every_certificate() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_replica_set("rs0", 3)
            .with_tls("requireSSL")
            .build();
        h.create(&mg).await;

        let err = h.reconcile(NS, "mg").await.unwrap_err();
        assert!(matches!(err, Error::DependencyNotReady { .. }));
        assert_eq!(err.reason(), WAITING_ON_CERTIFICATES);
        assert!(err.is_retryable());
        assert_eq!(count_in(&h, ResourceKind::StatefulSet).await, 0);

        let waiting = h.get(NS, "mg").await.unwrap();
        assert_eq!(
            condition_status_of(&waiting, condition_types::DEPENDENCIES_READY).as_deref(),
            Some(condition_status::FALSE)
        );

        // A partial set still writes nothing
        let secrets = required_secrets(&waiting, &plan_roles(&waiting));
        let (last, rest) = secrets.split_last().unwrap();
        for secret in rest {
            h.add_secret(NS, secret).await;
        }
        assert!(h.reconcile(NS, "mg").await.is_err());
        assert_eq!(count_in(&h, ResourceKind::StatefulSet).await, 0);

        h.add_secret(NS, last).await;
        h.reconcile(NS, "mg").await.unwrap();
        assert!(h.store.get::<StatefulSet>(NS, "mg").await.unwrap().is_found());
    }

    #[tokio::test]
    async fn test_policy_violation_is_fatal() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_version("2.6").build();
        h.create(&mg).await;

        let err = h.reconcile(NS, "mg").await.unwrap_err();
        assert!(err.is_policy_violation());
        assert!(!err.is_retryable());
        assert_eq!(count_in(&h, ResourceKind::StatefulSet).await, 0);
        assert!(h.events.reasons_for("mg").contains(&"UnsupportedVersion".to_string()));
    }

    #[tokio::test]
    async fn test_backup_schedule_follows_spec() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_backup_schedule("0 2 * * *", "backup-creds")
            .build();
        h.run_to_running(&mg).await;
        assert_eq!(count_in(&h, ResourceKind::CronJob).await, 1);

        h.store
            .merge::<MongoDB>(NS, "mg", json!({ "spec": { "backupSchedule": null } }))
            .await
            .unwrap();
        h.reconcile(NS, "mg").await.unwrap();
        assert_eq!(count_in(&h, ResourceKind::CronJob).await, 0);
    }
}

mod monitoring_tests {
    use super::*;

    const MONITOR: &str = "mongodb-db-mg";

    async fn service_monitor(h: &Harness, namespace: &str) -> Option<ServiceMonitor> {
        h.store
            .get::<ServiceMonitor>(namespace, MONITOR)
            .await
            .unwrap()
            .into_option()
    }

    async fn data_service(h: &Harness) -> Service {
        h.store.get::<Service>(NS, "mg").await.unwrap().into_option().unwrap()
    }

    #[tokio::test]
    async fn test_operator_agent_writes_service_monitor() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_operator_monitor("monitoring", "30s")
            .build();
        h.run_to_running(&mg).await;

        let monitor = service_monitor(&h, "monitoring").await.unwrap();
        assert_eq!(monitor.labels().get("release"), Some(&"prometheus".to_string()));
        assert_eq!(monitor.spec.endpoints.len(), 1);
        assert_eq!(monitor.spec.endpoints[0].port, EXPORTER_PORT_NAME);
        assert_eq!(monitor.spec.endpoints[0].interval.as_deref(), Some("30s"));

        let service = data_service(&h).await;
        assert_eq!(
            service.annotations().get(SERVICE_MONITOR_ANNOTATION),
            Some(&format!("monitoring/{}", MONITOR))
        );
        assert!(!service.annotations().contains_key("prometheus.io/scrape"));
    }

    #[tokio::test]
    async fn test_interval_change_patches_service_monitor() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_operator_monitor("monitoring", "30s")
            .build();
        h.run_to_running(&mg).await;

        h.store
            .merge::<MongoDB>(
                NS,
                "mg",
                json!({ "spec": { "monitor": { "prometheus": { "interval": "10s" } } } }),
            )
            .await
            .unwrap();
        h.reconcile(NS, "mg").await.unwrap();

        let monitor = service_monitor(&h, "monitoring").await.unwrap();
        assert_eq!(monitor.spec.endpoints[0].interval.as_deref(), Some("10s"));
    }

    #[tokio::test]
    async fn test_switch_to_builtin_agent_removes_service_monitor() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_operator_monitor("monitoring", "30s")
            .build();
        h.run_to_running(&mg).await;

        h.store
            .merge::<MongoDB>(
                NS,
                "mg",
                json!({ "spec": { "monitor": { "agent": "prometheus.io/builtin", "prometheus": null } } }),
            )
            .await
            .unwrap();
        h.reconcile(NS, "mg").await.unwrap();

        assert!(service_monitor(&h, "monitoring").await.is_none());
        let service = data_service(&h).await;
        assert!(!service.annotations().contains_key(SERVICE_MONITOR_ANNOTATION));
        assert_eq!(
            service.annotations().get("prometheus.io/scrape"),
            Some(&"true".to_string())
        );
    }

    #[tokio::test]
    async fn test_disabled_monitoring_removes_service_monitor() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_operator_monitor("monitoring", "30s")
            .build();
        h.run_to_running(&mg).await;

        h.store
            .merge::<MongoDB>(NS, "mg", json!({ "spec": { "monitor": null } }))
            .await
            .unwrap();
        h.reconcile(NS, "mg").await.unwrap();

        assert_eq!(count_in(&h, ResourceKind::ServiceMonitor).await, 0);
        assert!(!data_service(&h).await.annotations().contains_key(SERVICE_MONITOR_ANNOTATION));
    }

    #[tokio::test]
    async fn test_moved_service_monitor_leaves_nothing_behind() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_operator_monitor("monitoring", "30s")
            .build();
        h.run_to_running(&mg).await;

        h.store
            .merge::<MongoDB>(
                NS,
                "mg",
                json!({ "spec": { "monitor": { "prometheus": { "namespace": "observability" } } } }),
            )
            .await
            .unwrap();
        h.reconcile(NS, "mg").await.unwrap();

        assert!(service_monitor(&h, "monitoring").await.is_none());
        assert!(service_monitor(&h, "observability").await.is_some());
        assert_eq!(count_in(&h, ResourceKind::ServiceMonitor).await, 1);
    }

    #[tokio::test]
    async fn test_teardown_removes_service_monitor() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS)
            .with_operator_monitor("monitoring", "30s")
            .with_termination_policy("Halt")
            .build();
        h.run_to_running(&mg).await;
        assert_eq!(count_in(&h, ResourceKind::ServiceMonitor).await, 1);

        h.delete(NS, "mg").await;
        h.reconcile(NS, "mg").await.unwrap();

        assert!(h.get(NS, "mg").await.is_none());
        assert_eq!(count_in(&h, ResourceKind::ServiceMonitor).await, 0);
    }
}

mod initialization_tests {
    use super::*;

    async fn to_initializing(h: &Harness, mg: &MongoDB) {
        h.create(mg).await;
        h.reconcile(NS, &mg.name_any()).await.unwrap();
        let current = h.get(NS, &mg.name_any()).await.unwrap();
        h.mark_ready(&current).await;
    }

    #[tokio::test]
    async fn test_script_source_initializes_once() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_init_script("init-scripts").build();
        to_initializing(&h, &mg).await;
        h.reconcile(NS, "mg").await.unwrap();

        let current = h.get(NS, "mg").await.unwrap();
        assert_eq!(phase(&current), LifecyclePhase::Running);
        assert!(current.annotations().contains_key(INITIALIZED_ANNOTATION));
        assert_eq!(
            condition_status_of(&current, condition_types::INITIALIZED).as_deref(),
            Some(condition_status::TRUE)
        );
        assert!(!current.init_pending());
    }

    #[tokio::test]
    async fn test_snapshot_restore_succeeds() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_init_snapshot("snap-1").build();
        to_initializing(&h, &mg).await;

        // The restore already finished by the time the operator looks
        let job = Job {
            metadata: ObjectMeta {
                name: Some(restore_job_name("mg")),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        h.store.create(&job).await.unwrap();

        h.reconcile(NS, "mg").await.unwrap();
        let current = h.get(NS, "mg").await.unwrap();
        assert_eq!(phase(&current), LifecyclePhase::Running);
        assert!(h.events.reasons_for("mg").contains(&"Initialized".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_timeout_fails_and_is_never_retried() {
        let h = Harness::new();
        let mg = MongoDBBuilder::new("mg", NS).with_init_snapshot("snap-1").build();
        to_initializing(&h, &mg).await;

        h.reconcile(NS, "mg").await.unwrap();
        let failed = h.get(NS, "mg").await.unwrap();
        assert_eq!(phase(&failed), LifecyclePhase::Failed);
        assert_eq!(
            failed.status.as_ref().unwrap().reason.as_deref(),
            Some("InitializationTimeout")
        );
        assert!(failed.annotations().contains_key(INITIALIZED_ANNOTATION));
        assert_eq!(count_in(&h, ResourceKind::Job).await, 1);

        // Without a spec change the failure is left alone
        let writes = h.memory.writes_excluding(&[]);
        let action = h.reconcile(NS, "mg").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(h.memory.writes_excluding(&[]), writes);

        // A spec change brings the database up without a second attempt
        h.store
            .merge::<MongoDB>(
                NS,
                "mg",
                json!({ "spec": { "monitor": { "agent": "prometheus.io/builtin" } } }),
            )
            .await
            .unwrap();
        h.reconcile(NS, "mg").await.unwrap();
        let running = h.get(NS, "mg").await.unwrap();
        assert_eq!(phase(&running), LifecyclePhase::Running);
        assert_eq!(count_in(&h, ResourceKind::Job).await, 1);
        let job_writes = h.memory.writes(ResourceKind::Job);
        assert_eq!(job_writes, 1);
    }
}

mod termination_tests {
    use super::*;

    /// Running database with member pods and one data volume
    async fn running_with_data(h: &Harness, policy: &str) -> MongoDB {
        let mg = MongoDBBuilder::new("mg", NS)
            .with_storage("1Gi", None)
            .with_termination_policy(policy)
            .build();
        let running = h.run_to_running(&mg).await;
        h.add_member_pods(&running).await;
        h.add_volume(NS, "mg", "data-mg-0").await;
        running
    }

    #[tokio::test]
    async fn test_pause_keeps_data_and_records_origin() {
        let h = Harness::new();
        let running = running_with_data(&h, "Pause").await;
        h.delete(NS, "mg").await;
        h.reconcile(NS, "mg").await.unwrap();

        assert!(h.get(NS, "mg").await.is_none());
        assert_eq!(count_in(&h, ResourceKind::StatefulSet).await, 0);
        assert_eq!(count_in(&h, ResourceKind::Pod).await, 0);
        assert_eq!(count_in(&h, ResourceKind::PersistentVolumeClaim).await, 1);
        assert!(h.secret_exists(NS, "mg-auth").await);

        let record = h.get_dormant(NS, "mg").await.unwrap();
        assert_eq!(record.phase(), DormantPhase::Paused);
        assert!(record.finalizers().contains(&FINALIZER.to_string()));
        assert!(!record.spec.wipe_out);
        assert_eq!(record.spec.origin.spec.mongodb.as_ref(), Some(&running.spec));
        assert!(h.events.reasons_for("mg").contains(&"Paused".to_string()));
    }

    #[tokio::test]
    async fn test_resume_consumes_disarmed_record() {
        let h = Harness::new();
        running_with_data(&h, "Pause").await;
        h.delete(NS, "mg").await;
        h.reconcile(NS, "mg").await.unwrap();

        let again = MongoDBBuilder::new("mg", NS)
            .with_storage("1Gi", None)
            .with_termination_policy("Pause")
            .build();
        let decision = h.pipeline().validate(&create_request(&again)).await;
        assert!(decision.is_allowed(), "{:?}", decision);

        let record = h.get_dormant(NS, "mg").await.unwrap();
        assert!(record.finalizers().is_empty());

        h.create(&again).await;
        h.reconcile(NS, "mg").await.unwrap();
        assert!(h.get_dormant(NS, "mg").await.is_none());
        assert_eq!(phase(&h.get(NS, "mg").await.unwrap()), LifecyclePhase::Creating);
        assert!(h.events.reasons_for("mg").contains(&"Resumed".to_string()));
        assert_eq!(count_in(&h, ResourceKind::PersistentVolumeClaim).await, 1);
    }

    #[tokio::test]
    async fn test_armed_record_blocks_bypassed_create() {
        let h = Harness::new();
        running_with_data(&h, "Pause").await;
        h.delete(NS, "mg").await;
        h.reconcile(NS, "mg").await.unwrap();

        // Created without passing admission
        h.create(&create_test_mongodb("mg", NS)).await;
        let err = h.reconcile(NS, "mg").await.unwrap_err();
        assert_eq!(err.reason(), NOT_DISARMED);
        assert!(!err.is_retryable());
        assert!(h.get_dormant(NS, "mg").await.is_some());
        assert_eq!(count_in(&h, ResourceKind::StatefulSet).await, 0);
    }

    #[tokio::test]
    async fn test_halt_keeps_data_without_record() {
        let h = Harness::new();
        running_with_data(&h, "Halt").await;
        h.delete(NS, "mg").await;
        h.reconcile(NS, "mg").await.unwrap();

        assert!(h.get(NS, "mg").await.is_none());
        assert!(h.get_dormant(NS, "mg").await.is_none());
        assert_eq!(count_in(&h, ResourceKind::PersistentVolumeClaim).await, 1);
        assert!(h.secret_exists(NS, "mg-auth").await);
        assert!(h.events.reasons_for("mg").contains(&"Halted".to_string()));
    }

    #[tokio::test]
    async fn test_wipe_out_removes_volumes_and_credentials() {
        let h = Harness::new();
        running_with_data(&h, "WipeOut").await;
        h.delete(NS, "mg").await;
        h.reconcile(NS, "mg").await.unwrap();

        assert!(h.get(NS, "mg").await.is_none());
        assert!(h.get_dormant(NS, "mg").await.is_none());
        assert_eq!(count_in(&h, ResourceKind::PersistentVolumeClaim).await, 0);
        assert!(!h.secret_exists(NS, "mg-auth").await);
    }

    #[tokio::test]
    async fn test_wipe_out_keeps_shared_credentials() {
        let h = Harness::new();
        for name in ["a", "b"] {
            let mg = MongoDBBuilder::new(name, NS)
                .with_auth_secret("shared-auth")
                .with_termination_policy("WipeOut")
                .build();
            h.run_to_running(&mg).await;
        }

        h.delete(NS, "a").await;
        h.reconcile(NS, "a").await.unwrap();
        assert!(h.get(NS, "a").await.is_none());
        assert!(h.secret_exists(NS, "shared-auth").await);

        h.delete(NS, "b").await;
        h.reconcile(NS, "b").await.unwrap();
        assert!(!h.secret_exists(NS, "shared-auth").await);
    }

    #[tokio::test]
    async fn test_wipe_out_keeps_credentials_of_pausing_neighbour() {
        let h = Harness::new();
        for (name, policy) in [("a", "Pause"), ("b", "WipeOut")] {
            let mg = MongoDBBuilder::new(name, NS)
                .with_auth_secret("shared-auth")
                .with_termination_policy(policy)
                .build();
            h.run_to_running(&mg).await;
        }

        // Both deletions land before either teardown ran
        h.delete(NS, "a").await;
        h.delete(NS, "b").await;
        h.reconcile(NS, "b").await.unwrap();
        assert!(h.get(NS, "b").await.is_none());
        assert!(h.secret_exists(NS, "shared-auth").await);

        h.reconcile(NS, "a").await.unwrap();
        assert!(h.get_dormant(NS, "a").await.is_some());
        assert!(h.secret_exists(NS, "shared-auth").await);
    }

    #[tokio::test]
    async fn test_do_not_terminate_refuses_bypassed_deletion() {
        let h = Harness::new();
        running_with_data(&h, "DoNotTerminate").await;
        h.delete(NS, "mg").await;

        let err = h.reconcile(NS, "mg").await.unwrap_err();
        assert_eq!(err.reason(), DO_NOT_TERMINATE);
        assert!(!err.is_retryable());

        let current = h.get(NS, "mg").await.unwrap();
        assert!(current.metadata.deletion_timestamp.is_some());
        assert_eq!(count_in(&h, ResourceKind::StatefulSet).await, 1);
        assert_eq!(count_in(&h, ResourceKind::Pod).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lingering_pods_bound_the_teardown() {
        let h = Harness::new();
        running_with_data(&h, "Halt").await;

        // A pod nothing owns survives the workload deletion
        let orphan = Pod {
            metadata: ObjectMeta {
                name: Some("mg-orphan".to_string()),
                namespace: Some(NS.to_string()),
                labels: Some(mongodb_operator::resources::standard_labels("mg")),
                ..Default::default()
            },
            ..Default::default()
        };
        h.store.create(&orphan).await.unwrap();

        h.delete(NS, "mg").await;
        let err = h.reconcile(NS, "mg").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("mg-orphan"));

        let current = h.get(NS, "mg").await.unwrap();
        assert_eq!(phase(&current), LifecyclePhase::Pausing);
        assert!(current.finalizers().contains(&FINALIZER.to_string()));

        h.store
            .delete::<Pod>(NS, "mg-orphan", mongodb_operator::store::Propagation::Background)
            .await
            .unwrap();
        h.reconcile(NS, "mg").await.unwrap();
        assert!(h.get(NS, "mg").await.is_none());
    }

    #[tokio::test]
    async fn test_owned_children_are_collected_after_teardown() {
        let h = Harness::new();
        running_with_data(&h, "Halt").await;
        h.delete(NS, "mg").await;
        h.reconcile(NS, "mg").await.unwrap();

        assert_eq!(count_in(&h, ResourceKind::Service).await, 1);
        assert!(
            h.memory
                .snapshot(&ObjectKey::new(ResourceKind::Service, NS, &h.config.governing_service))
                .is_some()
        );
        assert_eq!(count_in(&h, ResourceKind::ServiceAccount).await, 0);
        assert_eq!(count_in(&h, ResourceKind::RoleBinding).await, 0);
    }
}

mod dormant_tests {
    use super::*;

    async fn paused(h: &Harness) {
        let mg = MongoDBBuilder::new("mg", NS)
            .with_storage("1Gi", None)
            .with_replica_set("rs0", 1)
            .build();
        h.run_to_running(&mg).await;
        h.add_volume(NS, "mg", "data-mg-0").await;
        h.delete(NS, "mg").await;
        h.reconcile(NS, "mg").await.unwrap();
    }

    #[tokio::test]
    async fn test_unarmed_record_changes_nothing() {
        let h = Harness::new();
        paused(&h).await;
        let writes = h.memory.writes_excluding(&[]);
        h.reconcile_dormant(NS, "mg").await.unwrap();
        assert_eq!(h.memory.writes_excluding(&[]), writes);
    }

    #[tokio::test]
    async fn test_armed_record_wipes_out_then_releases() {
        let h = Harness::new();
        paused(&h).await;

        h.store
            .merge::<mongodb_operator::DormantDatabase>(NS, "mg", json!({ "spec": { "wipeOut": true } }))
            .await
            .unwrap();
        h.reconcile_dormant(NS, "mg").await.unwrap();

        let record = h.get_dormant(NS, "mg").await.unwrap();
        assert_eq!(record.phase(), DormantPhase::WipedOut);
        assert!(record.status.as_ref().unwrap().wiped_out_time.is_some());
        assert_eq!(count_in(&h, ResourceKind::PersistentVolumeClaim).await, 0);
        assert!(!h.secret_exists(NS, "mg-auth").await);
        assert!(!h.secret_exists(NS, "mg-key").await);

        // A wiped-out record cannot be resumed
        let decision = h
            .pipeline()
            .validate(&create_request(&create_test_mongodb("mg", NS)))
            .await;
        assert!(!decision.is_allowed());

        h.store
            .delete::<mongodb_operator::DormantDatabase>(
                NS,
                "mg",
                mongodb_operator::store::Propagation::Background,
            )
            .await
            .unwrap();
        h.reconcile_dormant(NS, "mg").await.unwrap();
        assert!(h.get_dormant(NS, "mg").await.is_none());
    }

    #[tokio::test]
    async fn test_volumes_of_other_databases_survive_wipe_out() {
        let h = Harness::new();
        paused(&h).await;
        h.add_volume(NS, "other", "data-other-0").await;

        h.store
            .merge::<mongodb_operator::DormantDatabase>(NS, "mg", json!({ "spec": { "wipeOut": true } }))
            .await
            .unwrap();
        h.reconcile_dormant(NS, "mg").await.unwrap();

        let claims = h
            .store
            .list::<PersistentVolumeClaim>(Some(NS), &Default::default())
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].name_any(), "data-other-0");
    }
}
