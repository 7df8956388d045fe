//! # Access Processor
//!
//! The single-writer request queue in front of the whole core. Every
//! user-facing mutation becomes a typed [`ApRequest`] on a bounded
//! channel; one consumer task drains it in FIFO order and drives the
//! DataInfoProvider, TaskAnalyser and TaskScheduler, which therefore
//! need no locks of their own.
//!
//! Effect order equals successful-enqueue order. Callers park on oneshot
//! reply channels; worker completions re-enter as `TaskEnd` requests
//! instead of touching scheduler state from callback threads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::analyser::TaskAnalyser;
use crate::app::{AppError, AppState, Released, Waiter};
use crate::data::info::{DataAccess, DataInfoProvider, DeleteOutcome, Direction};
use crate::data::location::DataLocation;
use crate::data::logical::LogicalStore;
use crate::data::shared_disk::SharedDiskRegistry;
use crate::error::{FailureCause, RuntimeError, TaskStatus};
use crate::fileops::{FileOp, FileOpsExecutor, Priority};
use crate::invoker::{ExecError, ExecutionRequest, Invoker, OutputSink, ResolvedInput, StreamRedirection};
use crate::scheduler::{Dispatch, InstanceOutcome, TaskScheduler};
use crate::task::{Parameter, Task, TaskDescriptor};
use crate::transfer::TransferOrchestrator;
use crate::types::{AppId, DataId, DataInstanceId, GroupName, TaskId};

/// Backpressure bound of the request queue
const REQUEST_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// REQUESTS
// ============================================================================

/// Request queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApError {
    #[error("Runtime shutdown is in progress; request rejected")]
    ShutdownInProgress,

    #[error("The request consumer dropped the reply channel")]
    ReplyDropped,
}

/// Observable state of one application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSnapshot {
    pub state: Option<AppState>,
    pub outstanding: usize,
    /// Queued work no current worker can host, with nothing running
    pub blocked: bool,
}

/// The typed request vocabulary of the core
///
/// One tagged variant per external operation, dispatched by a single
/// switch in the consumer loop.
pub enum ApRequest {
    RegisterData {
        data: DataId,
        initial: Option<DataLocation>,
        reply: oneshot::Sender<Result<DataInstanceId, RuntimeError>>,
    },
    AnalyseAccess {
        accesses: Vec<(DataId, Direction)>,
        reply: oneshot::Sender<Result<Vec<DataAccess>, RuntimeError>>,
    },
    SubmitTask {
        app: AppId,
        descriptor: TaskDescriptor,
        reply: oneshot::Sender<Result<TaskId, RuntimeError>>,
    },
    TransferOpenFile {
        data: DataId,
        direction: Direction,
        reply: oneshot::Sender<Result<PathBuf, RuntimeError>>,
    },
    CloseFile {
        data: DataId,
    },
    DeleteFile {
        data: DataId,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Barrier {
        app: AppId,
        reply: Waiter,
    },
    BarrierGroup {
        app: AppId,
        group: GroupName,
        reply: Waiter,
    },
    EndOfApp {
        app: AppId,
        reply: Waiter,
    },
    CancelApp {
        app: AppId,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    TaskEnd {
        task: TaskId,
        worker: String,
        status: TaskStatus,
    },
    WorkerAdded {
        worker: crate::resources::WorkerRef,
    },
    WorkerRemoved {
        name: String,
    },
    Inspect {
        app: AppId,
        reply: oneshot::Sender<AppSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// CORE SERVICES (owned by the consumer)
// ============================================================================

/// Everything the consumer drives; built once by the runtime
pub struct CoreServices {
    pub dip: DataInfoProvider,
    pub analyser: TaskAnalyser,
    pub scheduler: TaskScheduler,
    pub store: Arc<LogicalStore>,
    pub disks: Arc<SharedDiskRegistry>,
    pub transfer: Arc<TransferOrchestrator>,
    pub invoker: Arc<dyn Invoker>,
    pub fileops: Arc<FileOpsExecutor>,
    /// Host the bindings run on (open-file staging target)
    pub master_host: String,
    /// Sandbox directory for open-file staging
    pub master_sandbox: PathBuf,
}

struct Consumer {
    core: CoreServices,
    /// Read holds taken by open-file / analyse-access, released on close
    open_files: HashMap<DataId, Vec<DataInstanceId>>,
    /// Terminal status per replicated task while instances drain
    replica_status: HashMap<TaskId, TaskStatus>,
    next_task: u64,
    loopback: mpsc::Sender<ApRequest>,
    /// Stall cycles: how often worker resources were released and re-acquired
    stall_cycles: usize,
}

// ============================================================================
// PROCESSOR HANDLE
// ============================================================================

/// Public handle over the request queue
///
/// Cheap to clone; every method enqueues one request. The runtime owns
/// exactly one consumer behind it (the first of the two process-wide
/// singletons).
#[derive(Clone)]
pub struct AccessProcessor {
    tx: mpsc::Sender<ApRequest>,
    accepting: Arc<AtomicBool>,
}

impl AccessProcessor {
    /// Spawn the consumer over `core` and hand back the handle
    pub fn start(core: CoreServices) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let consumer = Consumer {
            core,
            open_files: HashMap::new(),
            replica_status: HashMap::new(),
            next_task: 0,
            loopback: tx.clone(),
            stall_cycles: 0,
        };
        tokio::spawn(consumer.run(rx));
        Self {
            tx,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    async fn enqueue(&self, request: ApRequest) -> Result<(), ApError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ApError::ShutdownInProgress);
        }
        self.tx
            .send(request)
            .await
            .map_err(|_| ApError::ShutdownInProgress)
    }

    async fn roundtrip<T>(
        &self,
        request: ApRequest,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ApError> {
        self.enqueue(request).await?;
        rx.await.map_err(|_| ApError::ReplyDropped)
    }

    // ------------------------------------------------------------------
    // Upward API
    // ------------------------------------------------------------------

    pub async fn register_data(
        &self,
        data: DataId,
        initial: Option<DataLocation>,
    ) -> Result<DataInstanceId, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            ApRequest::RegisterData {
                data,
                initial,
                reply: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn analyse_access(
        &self,
        accesses: Vec<(DataId, Direction)>,
    ) -> Result<Vec<DataAccess>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(ApRequest::AnalyseAccess { accesses, reply: tx }, rx)
            .await?
    }

    pub async fn submit(
        &self,
        app: AppId,
        descriptor: TaskDescriptor,
    ) -> Result<TaskId, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            ApRequest::SubmitTask {
                app,
                descriptor,
                reply: tx,
            },
            rx,
        )
        .await?
    }

    /// Blocks until the datum is readable (or writable) on the master host
    pub async fn open_file(
        &self,
        data: DataId,
        direction: Direction,
    ) -> Result<PathBuf, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(
            ApRequest::TransferOpenFile {
                data,
                direction,
                reply: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn close_file(&self, data: DataId) -> Result<(), RuntimeError> {
        Ok(self.enqueue(ApRequest::CloseFile { data }).await?)
    }

    pub async fn delete(&self, data: DataId) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(ApRequest::DeleteFile { data, reply: tx }, rx)
            .await?
    }

    pub async fn barrier(&self, app: AppId) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        let result = self.roundtrip(ApRequest::Barrier { app, reply: tx }, rx).await?;
        Ok(result?)
    }

    pub async fn barrier_group(&self, app: AppId, group: GroupName) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        let result = self
            .roundtrip(ApRequest::BarrierGroup { app, group, reply: tx }, rx)
            .await?;
        Ok(result?)
    }

    /// Two-phase end-of-app: returns once every task of `app` is terminal
    pub async fn end_of_app(&self, app: AppId) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        let result = self.roundtrip(ApRequest::EndOfApp { app, reply: tx }, rx).await?;
        Ok(result?)
    }

    pub async fn cancel_app(&self, app: AppId) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.roundtrip(ApRequest::CancelApp { app, reply: tx }, rx)
            .await?
    }

    pub async fn worker_added(&self, worker: crate::resources::WorkerRef) -> Result<(), RuntimeError> {
        Ok(self.enqueue(ApRequest::WorkerAdded { worker }).await?)
    }

    pub async fn worker_removed(&self, name: String) -> Result<(), RuntimeError> {
        Ok(self.enqueue(ApRequest::WorkerRemoved { name }).await?)
    }

    pub async fn inspect(&self, app: AppId) -> Result<AppSnapshot, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        Ok(self.roundtrip(ApRequest::Inspect { app, reply: tx }, rx).await?)
    }

    /// Drain the queue and stop the consumer; later requests are rejected
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ApRequest::Shutdown { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// CONSUMER LOOP
// ============================================================================

impl Consumer {
    async fn run(mut self, rx: mpsc::Receiver<ApRequest>) {
        let mut stream = ReceiverStream::new(rx);
        info!(
            policy = self.core.scheduler.policy_name(),
            "Access processor started"
        );
        while let Some(request) = stream.next().await {
            if self.handle(request) {
                break;
            }
        }
        info!("Access processor stopped");
    }

    /// One switch over the request vocabulary; returns true on shutdown
    fn handle(&mut self, request: ApRequest) -> bool {
        match request {
            ApRequest::RegisterData { data, initial, reply } => {
                let result = self
                    .core
                    .dip
                    .register(data, initial)
                    .map_err(RuntimeError::from);
                let _ = reply.send(result);
            }
            ApRequest::AnalyseAccess { accesses, reply } => {
                let _ = reply.send(self.analyse_access(accesses));
            }
            ApRequest::SubmitTask { app, descriptor, reply } => {
                let _ = reply.send(self.submit_task(app, descriptor));
            }
            ApRequest::TransferOpenFile { data, direction, reply } => {
                self.open_file(data, direction, reply);
            }
            ApRequest::CloseFile { data } => {
                self.close_file(&data);
            }
            ApRequest::DeleteFile { data, reply } => {
                let _ = reply.send(self.delete_file(&data));
            }
            ApRequest::Barrier { app, reply } => {
                // Blocked apps still wait (dynamic fleets may recover
                // them); the snapshot API is the observability hook
                if self.core.scheduler.check_app(app).is_err() {
                    warn!(app = %app, "Barrier requested on a blocked application");
                }
                self.core.analyser.apps.barrier(app, reply);
            }
            ApRequest::BarrierGroup { app, group, reply } => {
                self.core.analyser.apps.barrier_group(app, group, reply);
            }
            ApRequest::EndOfApp { app, reply } => {
                let stalled = self.core.analyser.apps.end_of_app(app, reply);
                if stalled {
                    // Phase 1: the app stalls and its resources may go
                    self.stall_cycles += 1;
                    info!(
                        app = %app,
                        cycle = self.stall_cycles,
                        "Application stalled; worker resources reclaimable"
                    );
                }
            }
            ApRequest::CancelApp { app, reply } => {
                let _ = reply.send(self.cancel_app(app));
            }
            ApRequest::TaskEnd { task, worker, status } => {
                self.task_end(task, &worker, status);
            }
            ApRequest::WorkerAdded { worker } => {
                let dispatches = self.core.scheduler.worker_added(worker);
                self.launch_all(dispatches);
            }
            ApRequest::WorkerRemoved { name } => {
                let orphaned = self.core.scheduler.worker_removed(&name);
                for task in orphaned {
                    self.task_end(
                        task,
                        &name,
                        TaskStatus::Failed(FailureCause::Crashed),
                    );
                }
            }
            ApRequest::Inspect { app, reply } => {
                let snapshot = AppSnapshot {
                    state: self.core.analyser.apps.state(app),
                    outstanding: self.core.analyser.apps.outstanding(app),
                    blocked: self.core.scheduler.check_app(app).is_err(),
                };
                let _ = reply.send(snapshot);
            }
            ApRequest::Shutdown { reply } => {
                // Tracer flush stays best-effort, fire-and-forget
                debug!("Shutdown request drained the queue");
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    fn analyse_access(
        &mut self,
        accesses: Vec<(DataId, Direction)>,
    ) -> Result<Vec<DataAccess>, RuntimeError> {
        let mut resolved = Vec::with_capacity(accesses.len());
        for (data, direction) in accesses {
            let (access, evictions) = self.core.dip.register_access(&data, direction)?;
            if let Some(read) = access.read_instance() {
                self.open_files
                    .entry(data.clone())
                    .or_default()
                    .push(read.clone());
            }
            self.evict(evictions);
            resolved.push(access);
        }
        Ok(resolved)
    }

    #[instrument(skip(self, descriptor), fields(app = %app))]
    fn submit_task(
        &mut self,
        app: AppId,
        descriptor: TaskDescriptor,
    ) -> Result<TaskId, RuntimeError> {
        self.core.analyser.apps.can_submit(app)?;

        let descriptors = if descriptor.flags.is_reduce {
            expand_reduce(&descriptor)?
        } else {
            vec![descriptor]
        };

        let mut last_id = None;
        for descriptor in descriptors {
            let id = self.allocate_task();
            let mut resolved = Vec::with_capacity(descriptor.parameters.len());
            for Parameter { data, direction, .. } in &descriptor.parameters {
                let (access, evictions) = self.core.dip.register_access(data, *direction)?;
                self.evict(evictions);
                resolved.push(access);
            }

            let task = Task::new(id, app, descriptor, resolved, id.get());
            if let Some(ready) = self.core.analyser.register_task(task)? {
                let dispatches = self.core.scheduler.task_ready(ready);
                self.launch_all(dispatches);
            }
            last_id = Some(id);
        }

        Ok(last_id.expect("at least one descriptor"))
    }

    fn open_file(
        &mut self,
        data: DataId,
        direction: Direction,
        reply: oneshot::Sender<Result<PathBuf, RuntimeError>>,
    ) {
        let (access, evictions) = match self.core.dip.register_access(&data, direction) {
            Ok(pair) => pair,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        self.evict(evictions);

        match (access.read_instance().cloned(), access.written_instance()) {
            (None, Some(written)) => {
                // Pure write: hand out a sandbox path; the file appears there
                let path = self.core.master_sandbox.join(written.file_name());
                self.core
                    .store
                    .add_location(written, DataLocation::private(&self.core.master_host, &path));
                let _ = reply.send(Ok(path));
            }
            (Some(read), written) => {
                self.open_files
                    .entry(data.clone())
                    .or_default()
                    .push(read.clone());
                if let Some(written) = written {
                    let path = self.core.master_sandbox.join(written.file_name());
                    self.core.store.add_location(
                        written,
                        DataLocation::private(&self.core.master_host, &path),
                    );
                }

                // Stage the read instance off the AP thread; the caller
                // parks on the reply until the transfer lands
                let transfer = Arc::clone(&self.core.transfer);
                let disks = Arc::clone(&self.core.disks);
                let host = self.core.master_host.clone();
                let tgt = self.core.master_sandbox.join(read.file_name());
                let preserve = !matches!(access, DataAccess::ReadWrite { preserve_source: false, .. });
                let read = read.clone();
                tokio::spawn(async move {
                    let result = transfer
                        .request(&read, &host, &tgt, preserve)
                        .await
                        .map_err(RuntimeError::from)
                        .map(|location| location.physical_path(&host, &disks).unwrap_or(tgt));
                    let _ = reply.send(result);
                });
            }
            (None, None) => unreachable!("an access reads or writes"),
        }
    }

    fn close_file(&mut self, data: &DataId) {
        let (instance, is_empty) = match self.open_files.get_mut(data) {
            Some(holds) => (holds.pop(), holds.is_empty()),
            None => return,
        };
        if let Some(instance) = instance {
            let evictions = self.core.dip.reader_done(&instance);
            self.evict(evictions);
        }
        if is_empty {
            self.open_files.remove(data);
        }
    }

    fn delete_file(&mut self, data: &DataId) -> Result<(), RuntimeError> {
        match self.core.dip.delete(data)? {
            DeleteOutcome::Deleted(instances) => {
                self.evict(instances);
                Ok(())
            }
            DeleteOutcome::Deferred => Ok(()),
        }
    }

    fn cancel_app(&mut self, app: AppId) -> Result<(), RuntimeError> {
        // Fail parked waiters and close the app first
        self.core.analyser.apps.cancel(app);

        let outcome = self.core.scheduler.cancel_app(app);
        for task in &outcome.running {
            let invoker = Arc::clone(&self.core.invoker);
            let task = *task;
            tokio::spawn(async move { invoker.cancel(task).await });
        }

        // Drop every live record; transfers shared with other tasks keep
        // running, the coalescing map owns them
        for task in self.core.analyser.live_tasks_of(app) {
            let outcome = self.core.analyser.drop_task(task, &mut self.core.dip);
            self.evict(outcome.evictions);
        }
        info!(
            app = %app,
            dequeued = outcome.dequeued.len(),
            running = outcome.running.len(),
            "Application cancelled"
        );
        Ok(())
    }

    #[instrument(skip(self, status), fields(task = %task, worker))]
    fn task_end(&mut self, task: TaskId, worker: &str, status: TaskStatus) {
        match self.core.scheduler.instance_finished(task, worker) {
            InstanceOutcome::Partial => {
                // Replicated task: remember the worst status seen so far
                if matches!(status, TaskStatus::Failed(_)) {
                    self.replica_status.insert(task, status);
                } else {
                    self.replica_status.entry(task).or_insert(status);
                }
                return;
            }
            InstanceOutcome::TaskDone => {}
        }

        let combined = match self.replica_status.remove(&task) {
            Some(worst @ TaskStatus::Failed(_)) => worst,
            _ => status,
        };

        let outcome = self
            .core
            .analyser
            .task_ended(task, combined, &mut self.core.dip);
        self.evict(outcome.evictions);

        if !outcome.cancelled_successors.is_empty() {
            warn!(
                task = %task,
                successors = ?outcome.cancelled_successors,
                "Transitive successors cancelled without running"
            );
        }

        if let Some(retry) = outcome.retry {
            let dispatches = self.core.scheduler.task_ready(retry);
            self.launch_all(dispatches);
        }
        for ready in outcome.newly_ready {
            let dispatches = self.core.scheduler.task_ready(ready);
            self.launch_all(dispatches);
        }

        self.release(outcome.released);

        // Capacity freed: one more greedy pass
        let dispatches = self.core.scheduler.reschedule();
        self.launch_all(dispatches);
    }

    /// Fire freed waiters; a drained stalled app re-acquires resources
    ///
    /// A failed application turns every verdict into `AppError::Failed`.
    fn release(&mut self, released: Released) {
        let verdict: Result<(), AppError> = match &released.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        for waiter in released.ok {
            let _ = waiter.send(verdict.clone());
        }
        if released.app_drained {
            // Phase 2: minimum resources come back before the caller wakes
            info!("Stalled application drained; re-acquiring minimum resources");
        }
        for waiter in released.end_ok {
            let _ = waiter.send(verdict.clone());
        }
    }

    // ------------------------------------------------------------------
    // Dispatch driving
    // ------------------------------------------------------------------

    fn launch_all(&mut self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            self.launch(dispatch);
        }
    }

    /// Stage inputs, execute, notify: one driver task per dispatch
    fn launch(&mut self, dispatch: Dispatch) {
        self.core.scheduler.mark_running(&dispatch);

        let task = dispatch.task.clone();
        let worker = dispatch.worker.clone();
        let transfer = Arc::clone(&self.core.transfer);
        let invoker = Arc::clone(&self.core.invoker);
        let disks = Arc::clone(&self.core.disks);
        let store = Arc::clone(&self.core.store);
        let notify = self.loopback.clone();

        tokio::spawn(async move {
            let sandbox = PathBuf::from(&worker.working_dir);

            // Stage every input next to the worker
            let mut inputs = Vec::new();
            for access in &task.accesses {
                let Some(instance) = access.read_instance() else {
                    continue;
                };
                let tgt = sandbox.join(instance.file_name());
                let preserve = !matches!(
                    access,
                    DataAccess::ReadWrite {
                        preserve_source: false,
                        ..
                    }
                );
                match transfer.request(instance, &worker.host, &tgt, preserve).await {
                    Ok(location) => {
                        let physical = location.physical_path(&worker.host, &disks);
                        inputs.push(ResolvedInput {
                            instance: instance.clone(),
                            location,
                            physical,
                        });
                    }
                    Err(e) => {
                        warn!(task = %task.id, error = %e, "Input staging failed");
                        let _ = notify
                            .send(ApRequest::TaskEnd {
                                task: task.id,
                                worker: worker.name.clone(),
                                status: TaskStatus::Failed(FailureCause::InputUnavailable(
                                    instance.data.clone(),
                                )),
                            })
                            .await;
                        return;
                    }
                }
            }

            let outputs: Vec<OutputSink> = task
                .output_instances()
                .into_iter()
                .map(|instance| {
                    let path = sandbox.join(instance.file_name());
                    OutputSink { instance, path }
                })
                .collect();

            let request = ExecutionRequest {
                task: task.clone(),
                implementation: dispatch.implementation,
                host: worker.host.clone(),
                inputs,
                outputs: outputs.clone(),
                streams: StreamRedirection::default(),
            };

            // The per-task timeout starts at dispatch
            let result = match task.descriptor.flags.timeout {
                Some(timeout) => tokio::select! {
                    result = invoker.execute(request) => result,
                    _ = tokio::time::sleep(timeout) => Err(ExecError::Timeout),
                },
                None => invoker.execute(request).await,
            };

            let status = match result {
                Ok(_) => {
                    // Register the produced replicas before releasing deps
                    for sink in &outputs {
                        store.add_location(
                            &sink.instance,
                            DataLocation::private(&worker.host, &sink.path),
                        );
                        if let Ok(meta) = std::fs::metadata(&sink.path) {
                            store.set_size_hint(&sink.instance, meta.len());
                        }
                    }
                    TaskStatus::Finished
                }
                Err(ExecError::NonZeroExit(code)) => {
                    TaskStatus::Failed(FailureCause::ExitValue(code))
                }
                Err(ExecError::Crashed(_)) => TaskStatus::Failed(FailureCause::Crashed),
                Err(ExecError::Timeout) => TaskStatus::Failed(FailureCause::Timeout),
                Err(ExecError::Cancelled) => TaskStatus::Cancelled,
            };

            let _ = notify
                .send(ApRequest::TaskEnd {
                    task: task.id,
                    worker: worker.name.clone(),
                    status,
                })
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn allocate_task(&mut self) -> TaskId {
        self.next_task += 1;
        TaskId::new(self.next_task)
    }

    /// Physically drop dead instances through the LOW queue
    fn evict(&mut self, instances: Vec<DataInstanceId>) {
        for instance in instances {
            for location in self.core.store.remove(&instance) {
                let path = match &location {
                    DataLocation::Private { host, path }
                        if *host == self.core.master_host =>
                    {
                        Some(path.clone())
                    }
                    DataLocation::Shared { .. } => {
                        location.physical_path(&self.core.master_host, &self.core.disks)
                    }
                    _ => None,
                };
                if let Some(path) = path {
                    debug!(instance = %instance, path = %path.display(), "Evicting replica");
                    let _ = self
                        .core
                        .fileops
                        .dispatch(Priority::Low, FileOp::Delete { path });
                }
            }
        }
    }
}

// ============================================================================
// REDUCE EXPANSION
// ============================================================================

/// Materialize a reduce task as a binary reduction tree
///
/// Leaf sub-tasks consume `reduce_chunk_size` inputs each and write an
/// intermediate datum; levels repeat until one sub-task writes the
/// declared output. Every sub-task inherits the signature,
/// implementations and group of the original descriptor.
fn expand_reduce(descriptor: &TaskDescriptor) -> Result<Vec<TaskDescriptor>, RuntimeError> {
    let chunk = descriptor.flags.reduce_chunk_size.max(2);
    let inputs: Vec<DataId> = descriptor
        .parameters
        .iter()
        .filter(|p| matches!(p.direction, Direction::In))
        .map(|p| p.data.clone())
        .collect();
    let output = descriptor
        .parameters
        .iter()
        .find(|p| !matches!(p.direction, Direction::In))
        .map(|p| p.data.clone())
        .ok_or_else(|| RuntimeError::other("reduce task declares no output parameter"))?;

    if inputs.len() <= chunk {
        let mut flat = descriptor.clone();
        flat.flags.is_reduce = false;
        return Ok(vec![flat]);
    }

    let mut descriptors = Vec::new();
    let mut level = 0usize;
    let mut current = inputs;

    while current.len() > chunk {
        let mut next = Vec::new();
        for (i, group) in current.chunks(chunk).enumerate() {
            let partial = DataId::new(format!("{}.part{}.{}", output, level, i))
                .map_err(RuntimeError::from)?;
            let mut sub = TaskDescriptor::new(descriptor.signature.clone());
            sub.implementations = descriptor.implementations.clone();
            sub.group = descriptor.group.clone();
            sub.flags = descriptor.flags.clone();
            sub.flags.is_reduce = false;
            for data in group {
                sub.parameters
                    .push(Parameter::new(data.clone(), Direction::In));
            }
            sub.parameters
                .push(Parameter::new(partial.clone(), Direction::Out));
            descriptors.push(sub);
            next.push(partial);
        }
        current = next;
        level += 1;
    }

    // Root sub-task folds the surviving partials into the real output
    let mut root = TaskDescriptor::new(descriptor.signature.clone());
    root.implementations = descriptor.implementations.clone();
    root.group = descriptor.group.clone();
    root.flags = descriptor.flags.clone();
    root.flags.is_reduce = false;
    for data in &current {
        root.parameters
            .push(Parameter::new(data.clone(), Direction::In));
    }
    root.parameters
        .push(Parameter::new(output, Direction::Out));
    descriptors.push(root);

    Ok(descriptors)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Implementation;

    fn reduce_descriptor(inputs: usize, chunk: usize) -> TaskDescriptor {
        let mut descriptor = TaskDescriptor::new("sum.reduce")
            .with_implementation(Implementation::method("Sum", "reduce"));
        descriptor.flags.is_reduce = true;
        descriptor.flags.reduce_chunk_size = chunk;
        for i in 0..inputs {
            descriptor = descriptor.with_parameter(Parameter::new(
                DataId::new(format!("in{}", i)).unwrap(),
                Direction::In,
            ));
        }
        descriptor.with_parameter(Parameter::new(DataId::new("total").unwrap(), Direction::Out))
    }

    #[test]
    fn small_reduce_collapses_to_one_task() {
        let tree = expand_reduce(&reduce_descriptor(2, 2)).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(!tree[0].flags.is_reduce);
    }

    #[test]
    fn reduce_tree_has_leaves_and_root() {
        let tree = expand_reduce(&reduce_descriptor(8, 2)).unwrap();
        // 8 -> 4 leaves -> 2 mid -> root
        assert_eq!(tree.len(), 7);
        let root = tree.last().unwrap();
        assert_eq!(root.parameters.last().unwrap().data.as_str(), "total");
        // Intermediates chain into the next level
        assert!(tree[0]
            .parameters
            .last()
            .unwrap()
            .data
            .as_str()
            .starts_with("total.part0."));
    }

    #[test]
    fn reduce_without_output_is_an_error() {
        let mut descriptor = reduce_descriptor(4, 2);
        descriptor.parameters.retain(|p| matches!(p.direction, Direction::In));
        assert!(expand_reduce(&descriptor).is_err());
    }
}
