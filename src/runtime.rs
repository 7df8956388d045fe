//! # Runtime Assembly
//!
//! Explicit construction and teardown of the whole core: the two
//! process-wide singletons (the AccessProcessor and the SharedDisk
//! registry) plus the stores, executors and the scheduler, wired together
//! from a validated [`RuntimeConfig`]. Handles travel through this
//! context; nothing reaches for globals.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::access::{AccessProcessor, AppSnapshot, CoreServices};
use crate::analyser::TaskAnalyser;
use crate::config::RuntimeConfig;
use crate::data::info::{DataAccess, DataInfoProvider, Direction};
use crate::data::location::DataLocation;
use crate::data::logical::LogicalStore;
use crate::data::shared_disk::SharedDiskRegistry;
use crate::error::RuntimeError;
use crate::fileops::FileOpsExecutor;
use crate::invoker::{Invoker, MockInvoker, WIRE_VERSION};
use crate::resources::Worker;
use crate::scheduler::policy::{create_policy, SchedulingContext};
use crate::scheduler::TaskScheduler;
use crate::task::TaskDescriptor;
use crate::transfer::{LocalBackend, TransferBackend, TransferOrchestrator};
use crate::types::{AppId, DataId, GroupName, TaskId};

/// Host name the bindings run on; open-file staging lands here
pub const MASTER_HOST: &str = "master";

/// Install a fmt subscriber honouring `RUST_LOG`; safe to call twice
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

// ============================================================================
// RUNTIME
// ============================================================================

/// The assembled core; one per process
pub struct Runtime {
    ap: AccessProcessor,
    store: Arc<LogicalStore>,
    disks: Arc<SharedDiskRegistry>,
    fileops: Arc<FileOpsExecutor>,
    next_app: AtomicU64,
}

impl Runtime {
    /// Build and start the core with the default local collaborators
    pub fn start(config: RuntimeConfig) -> anyhow::Result<Self> {
        Self::start_with(config, Arc::new(MockInvoker::new()), None)
    }

    /// Build and start the core with explicit invoker / transfer backend
    pub fn start_with(
        config: RuntimeConfig,
        invoker: Arc<dyn Invoker>,
        backend: Option<Arc<dyn TransferBackend>>,
    ) -> anyhow::Result<Self> {
        if invoker.wire_version() != WIRE_VERSION {
            anyhow::bail!(
                "invoker '{}' speaks wire version {}, core speaks {}",
                invoker.name(),
                invoker.wire_version(),
                WIRE_VERSION
            );
        }

        let store = Arc::new(LogicalStore::new());
        let disks = Arc::new(SharedDiskRegistry::from_project(&config.project));
        let fileops = Arc::new(FileOpsExecutor::start());
        let backend = backend
            .unwrap_or_else(|| Arc::new(LocalBackend::new(Arc::clone(&fileops))) as Arc<dyn TransferBackend>);
        let transfer = Arc::new(TransferOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&disks),
            backend,
        ));

        let policy = create_policy(config.scheduler);
        let ctx = SchedulingContext::new(Arc::clone(&store), Arc::clone(&disks));
        let mut scheduler = TaskScheduler::new(policy, ctx);
        for worker in &config.project.workers {
            let host = config
                .resources
                .hosts
                .iter()
                .find(|h| h.host == worker.host);
            scheduler.worker_added(Worker::from_config(worker, host));
        }

        let master_sandbox = config.home.join("sandbox");
        std::fs::create_dir_all(&master_sandbox)
            .with_context(|| format!("creating sandbox at {}", master_sandbox.display()))?;

        let dip = DataInfoProvider::new(Arc::clone(&store));
        let analyser = TaskAnalyser::new();

        let core = CoreServices {
            dip,
            analyser,
            scheduler,
            store: Arc::clone(&store),
            disks: Arc::clone(&disks),
            transfer,
            invoker,
            fileops: Arc::clone(&fileops),
            master_host: MASTER_HOST.to_string(),
            master_sandbox,
        };

        info!(
            scheduler = %config.scheduler,
            workers = config.project.workers.len(),
            "Runtime started"
        );
        Ok(Self {
            ap: AccessProcessor::start(core),
            store,
            disks,
            fileops,
            next_app: AtomicU64::new(0),
        })
    }

    // ------------------------------------------------------------------
    // Upward API
    // ------------------------------------------------------------------

    /// Allocate a fresh application id
    pub fn register_app(&self) -> AppId {
        AppId::new(self.next_app.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub async fn register_data(
        &self,
        data: DataId,
        initial: Option<DataLocation>,
    ) -> Result<crate::types::DataInstanceId, RuntimeError> {
        self.ap.register_data(data, initial).await
    }

    /// Version a batch of main-code accesses without a task
    pub async fn access(
        &self,
        accesses: Vec<(DataId, Direction)>,
    ) -> Result<Vec<DataAccess>, RuntimeError> {
        self.ap.analyse_access(accesses).await
    }

    pub async fn submit(
        &self,
        app: AppId,
        descriptor: TaskDescriptor,
    ) -> Result<TaskId, RuntimeError> {
        self.ap.submit(app, descriptor).await
    }

    /// Blocks until the datum is readable on the master host
    pub async fn open_file(
        &self,
        data: DataId,
        direction: Direction,
    ) -> Result<PathBuf, RuntimeError> {
        self.ap.open_file(data, direction).await
    }

    pub async fn close_file(&self, data: DataId) -> Result<(), RuntimeError> {
        self.ap.close_file(data).await
    }

    pub async fn delete(&self, data: DataId) -> Result<(), RuntimeError> {
        self.ap.delete(data).await
    }

    pub async fn barrier(&self, app: AppId) -> Result<(), RuntimeError> {
        self.ap.barrier(app).await
    }

    pub async fn barrier_group(&self, app: AppId, group: GroupName) -> Result<(), RuntimeError> {
        self.ap.barrier_group(app, group).await
    }

    pub async fn end_of_app(&self, app: AppId) -> Result<(), RuntimeError> {
        self.ap.end_of_app(app).await
    }

    pub async fn cancel_app(&self, app: AppId) -> Result<(), RuntimeError> {
        self.ap.cancel_app(app).await
    }

    pub async fn inspect(&self, app: AppId) -> Result<AppSnapshot, RuntimeError> {
        self.ap.inspect(app).await
    }

    // ------------------------------------------------------------------
    // Fleet lifecycle
    // ------------------------------------------------------------------

    pub async fn worker_added(
        &self,
        worker: crate::resources::WorkerRef,
    ) -> Result<(), RuntimeError> {
        self.ap.worker_added(worker).await
    }

    pub async fn worker_removed(&self, name: impl Into<String>) -> Result<(), RuntimeError> {
        self.ap.worker_removed(name.into()).await
    }

    // ------------------------------------------------------------------
    // Shared state handles (read-mostly collaborator access)
    // ------------------------------------------------------------------

    pub fn store(&self) -> &Arc<LogicalStore> {
        &self.store
    }

    pub fn disks(&self) -> &Arc<SharedDiskRegistry> {
        &self.disks
    }

    pub fn fileops(&self) -> &Arc<FileOpsExecutor> {
        &self.fileops
    }

    /// Drain the request queue and stop; later submissions are rejected
    pub async fn shutdown(&self) {
        self.ap.shutdown().await;
        info!("Runtime stopped");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, ResourcesConfig};
    use tempfile::tempdir;

    fn config(home: &std::path::Path) -> RuntimeConfig {
        RuntimeConfig::new(home, ProjectConfig::default(), ResourcesConfig::default())
    }

    #[tokio::test]
    async fn starts_and_shuts_down() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::start(config(dir.path())).unwrap();

        let app = runtime.register_app();
        assert_eq!(app, AppId::new(1));

        runtime.shutdown().await;
        let err = runtime
            .submit(app, TaskDescriptor::new("late"))
            .await
            .unwrap_err();
        assert!(err.is_shutdown());
    }

    #[tokio::test]
    async fn app_ids_are_unique() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::start(config(dir.path())).unwrap();
        assert_ne!(runtime.register_app(), runtime.register_app());
        runtime.shutdown().await;
    }

    struct StaleInvoker;

    #[async_trait::async_trait]
    impl Invoker for StaleInvoker {
        fn name(&self) -> &str {
            "stale"
        }
        fn wire_version(&self) -> u32 {
            0
        }
        async fn execute(
            &self,
            _request: crate::invoker::ExecutionRequest,
        ) -> Result<i32, crate::invoker::ExecError> {
            Ok(0)
        }
        async fn cancel(&self, _task: TaskId) {}
    }

    #[tokio::test]
    async fn rejects_wire_version_mismatch() {
        let dir = tempdir().unwrap();
        let err = Runtime::start_with(config(dir.path()), Arc::new(StaleInvoker), None)
            .err()
            .expect("mismatched wire version must fail startup");
        assert!(err.to_string().contains("wire version"));
    }
}
