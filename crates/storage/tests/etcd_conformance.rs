//! Runs the conformance suite against a real etcd cluster.
//!
//! Skipped unless `PCS_TEST_ETCD_ENDPOINTS` holds a comma-separated endpoint
//! list, e.g. `http://localhost:2379`; plaintext endpoints turn TLS off.
//! Every storage test writes under its own key prefix, so runs never see
//! each other's records.

use std::time::Duration;

use pcs_storage::conformance::{run_lock_suite, run_storage_suite};
use pcs_storage::{
    DistributedLockProvider, EtcdConfig, EtcdLockProvider, EtcdStorage, LockName,
    StorageProvider,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn endpoints() -> Option<Vec<String>> {
    let raw = std::env::var("PCS_TEST_ETCD_ENDPOINTS").ok()?;
    Some(raw.split(',').map(|e| e.trim().to_string()).collect())
}

fn config(endpoints: &[String], key_prefix: String) -> EtcdConfig {
    EtcdConfig {
        endpoints: endpoints.to_vec(),
        insecure: endpoints.iter().any(|e| e.starts_with("http://")),
        key_prefix,
        retry_count: 1,
        retry_wait: Duration::from_secs(1),
        // Small pages so large transitions span several keys.
        page_size: 50,
        ..EtcdConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn etcd_storage_conformance() {
    let Some(endpoints) = endpoints() else {
        eprintln!("PCS_TEST_ETCD_ENDPOINTS not set, skipping");
        return;
    };
    init_tracing();

    let report = run_storage_suite(|| {
        let config = config(&endpoints, format!("/pcs-test/{}", Uuid::new_v4()));
        async move {
            let storage = EtcdStorage::new(config);
            storage.init(None).await.expect("init etcd storage");
            storage
        }
    })
    .await;
    assert_eq!(report.failed(), 0, "{report}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn etcd_lock_conformance() {
    let Some(endpoints) = endpoints() else {
        eprintln!("PCS_TEST_ETCD_ENDPOINTS not set, skipping");
        return;
    };
    init_tracing();
    // One prefix for the whole run: every provider must contend for one key.
    let prefix = format!("/pcs-test-lock/{}", Uuid::new_v4());

    let report = run_lock_suite(|| {
        let config = config(&endpoints, prefix.clone());
        async move {
            let lock = EtcdLockProvider::new(config, LockName::default());
            lock.init(None).await.expect("init etcd lock");
            lock
        }
    })
    .await;
    assert_eq!(report.failed(), 0, "{report}");
}

#[tokio::test]
async fn oversized_value_is_conflict_retry() {
    let Some(endpoints) = endpoints() else {
        eprintln!("PCS_TEST_ETCD_ENDPOINTS not set, skipping");
        return;
    };
    let storage = EtcdStorage::new(EtcdConfig {
        max_value_bytes: 256,
        ..config(&endpoints, format!("/pcs-test/{}", Uuid::new_v4()))
    });
    storage.init(None).await.expect("init etcd storage");

    let locations = (0..40)
        .map(|i| pcs_model::Location::new(format!("x{i}c0s0b0n0")))
        .collect();
    let t = pcs_model::Transition::new(pcs_model::PowerOperation::On, locations, 5);
    match storage.store_transition(t).await {
        Err(pcs_storage::StorageError::ConflictRetry { .. }) => {}
        other => panic!("expected ConflictRetry, got {other:?}"),
    }
}
