use pcs_storage::conformance::{run_lock_suite, run_storage_suite, Section};
use pcs_storage::{
    DistributedLockProvider, LockName, MemoryLockProvider, MemoryStorage, StorageProvider,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn memory_storage_conformance() {
    init_tracing();
    let report = run_storage_suite(|| async {
        let storage = MemoryStorage::new();
        storage.init(None).await.expect("init memory storage");
        storage
    })
    .await;
    assert_eq!(report.failed(), 0, "{report}");
    let sections: Vec<Section> = report.tallies().into_keys().collect();
    assert_eq!(
        sections,
        [
            Section::Lifecycle,
            Section::PowerStatus,
            Section::Transition,
            Section::PowerCap,
            Section::Concurrency,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_lock_conformance() {
    init_tracing();
    // Unique per run so parallel test binaries never share the lock.
    let name = LockName::new("pcs-test", format!("memory-{}", Uuid::new_v4()));
    let report = run_lock_suite(|| {
        let name = name.clone();
        async move {
            let lock = MemoryLockProvider::new(name);
            lock.init(None).await.expect("init memory lock");
            lock
        }
    })
    .await;
    assert_eq!(report.failed(), 0, "{report}");
    let lock = report.tallies()[&Section::Lock];
    assert_eq!(lock.passed, report.cases.len());
}

#[tokio::test]
async fn memory_storage_logs_under_caller_span() {
    init_tracing();
    let storage = MemoryStorage::new();
    storage
        .init(Some(tracing::info_span!("pcs", replica = 1)))
        .await
        .expect("init with span");
    storage.ping().await.expect("ping");
    storage.close().await.expect("close");
}
