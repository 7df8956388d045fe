//! # Transfer Integration Tests
//!
//! Fleet-level staging behaviour: the shared-disk shortcut must move
//! zero bytes, and source failures must fall back to surviving replicas.

use std::sync::Arc;

use vela::config::{ProjectConfig, ResourcesConfig};
use vela::fileops::FileOpsExecutor;
use vela::{
    Constraints, DataId, DataInstanceId, DataLocation, Direction, Implementation, LocalBackend,
    LogicalStore, MockInvoker, Parameter, Runtime, RuntimeConfig, SharedDiskRegistry,
    TaskDescriptor, TransferBackend, TransferOrchestrator, Version,
};

// ============================================================================
// SHARED-DISK SHORTCUT (fleet level)
// ============================================================================

/// Two hosts mounting the same disk (one real directory in the test):
/// a task scheduled on the second host reads the file with zero copies.
#[tokio::test]
async fn shared_disk_read_moves_zero_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let nfs = dir.path().join("nfs");
    std::fs::create_dir_all(&nfs).unwrap();
    std::fs::write(nfs.join("f.1"), b"shared payload").unwrap();

    let project = ProjectConfig::from_yaml(&format!(
        r#"
workers:
  - name: w1
    host: h1
    working_dir: {home}/w1
    mounts:
      nfs: {nfs}
  - name: w2
    host: h2
    working_dir: {home}/w2
    mounts:
      nfs: {nfs}
shared_disks:
  - name: nfs
"#,
        home = dir.path().display(),
        nfs = nfs.display(),
    ))
    .unwrap();
    let resources = ResourcesConfig::from_yaml(
        r#"
hosts:
  - host: h1
    processors:
      - name: main
        architecture: x86_64
        cores: 4
    memory_gb: 16
  - host: h2
    processors:
      - name: main
        architecture: x86_64
        cores: 4
    memory_gb: 16
    software: [reader]
"#,
    )
    .unwrap();

    let fileops = Arc::new(FileOpsExecutor::start());
    let backend = Arc::new(LocalBackend::new(Arc::clone(&fileops)));
    let invoker = Arc::new(MockInvoker::new());
    let runtime = Runtime::start_with(
        RuntimeConfig::new(dir.path(), project, resources),
        invoker.clone(),
        Some(backend.clone() as Arc<dyn TransferBackend>),
    )
    .unwrap();

    let app = runtime.register_app();
    let data = DataId::new("f").unwrap();
    runtime
        .register_data(data.clone(), Some(DataLocation::shared("nfs", "f.1")))
        .await
        .unwrap();

    // The software constraint pins the reader to h2
    let descriptor = TaskDescriptor::new("reader.consume")
        .with_implementation(
            Implementation::method("Reader", "consume")
                .with_constraints(Constraints::one_core().with_software("reader")),
        )
        .with_parameter(Parameter::new(data, Direction::In));
    let task = runtime.submit(app, descriptor).await.unwrap();
    runtime.barrier(app).await.unwrap();

    assert_eq!(invoker.executed_on(task), Some("h2".into()));
    assert_eq!(backend.local_copies(), 0, "the mount satisfies the read");
    assert_eq!(backend.remote_copies(), 0);
    runtime.shutdown().await;
}

// ============================================================================
// SOURCE FALLBACK
// ============================================================================

/// A dead replica path is skipped; the surviving replica serves the copy.
#[tokio::test]
async fn transfer_retries_alternative_sources() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good/d.1");
    std::fs::create_dir_all(good.parent().unwrap()).unwrap();
    std::fs::write(&good, b"payload").unwrap();

    let store = Arc::new(LogicalStore::new());
    let disks = Arc::new(SharedDiskRegistry::new());
    let backend = Arc::new(LocalBackend::new(Arc::new(FileOpsExecutor::start())));
    let orchestrator = TransferOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&disks),
        backend.clone() as Arc<dyn TransferBackend>,
    );

    let instance = DataInstanceId::new(DataId::new("d").unwrap(), Version::FIRST);
    store.add_location(
        &instance,
        DataLocation::private("h1", dir.path().join("vanished/d.1")),
    );
    store.add_location(&instance, DataLocation::private("h2", &good));

    let tgt = dir.path().join("w3/d.1");
    let location = orchestrator
        .request(&instance, "h3", &tgt, true)
        .await
        .expect("one source survives");

    assert_eq!(location, DataLocation::private("h3", &tgt));
    assert!(tgt.exists());
}
