//! # Invoker Abstraction Layer
//!
//! Trait and test double for the engines that actually run a task on a
//! worker. Production invokers (binary, MPI, container, service) live
//! outside the core and speak a positional argument protocol with the
//! worker scripts; that wire is versioned here so both sides can check
//! compatibility at startup.
//!
//! The in-tree [`MockInvoker`] mirrors production behaviour closely
//! enough for the runtime tests: it materializes output files, honours
//! per-signature failure injection and reacts to best-effort cancels.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::data::location::DataLocation;
use crate::task::Task;
use crate::types::{DataInstanceId, TaskId};

/// Version of the positional argument protocol between the core and the
/// external worker scripts
pub const WIRE_VERSION: u32 = 1;

// ============================================================================
// REQUEST / ERROR TYPES
// ============================================================================

/// One staged input, resolved to something the worker can open
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub instance: DataInstanceId,
    pub location: DataLocation,
    /// Physical path on the executing host, when the location has one
    pub physical: Option<PathBuf>,
}

/// Where one output instance must land
#[derive(Debug, Clone)]
pub struct OutputSink {
    pub instance: DataInstanceId,
    pub path: PathBuf,
}

/// Standard stream wiring for the spawned process
#[derive(Debug, Clone, Default)]
pub struct StreamRedirection {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Everything an invoker needs to run one task instance
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task: Task,
    /// Index into the descriptor's implementation set
    pub implementation: usize,
    /// Host the instance runs on
    pub host: String,
    pub inputs: Vec<ResolvedInput>,
    pub outputs: Vec<OutputSink>,
    pub streams: StreamRedirection,
}

/// Execution failures an invoker reports
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("Task exited with code {0}")]
    NonZeroExit(i32),

    #[error("Execution engine crashed: {0}")]
    Crashed(String),

    #[error("Task timed out")]
    Timeout,

    #[error("Task was cancelled")]
    Cancelled,
}

// ============================================================================
// TRAIT
// ============================================================================

/// The downward execution seam
#[async_trait]
pub trait Invoker: Send + Sync {
    fn name(&self) -> &str;

    /// Protocol version this invoker speaks
    fn wire_version(&self) -> u32 {
        WIRE_VERSION
    }

    /// Run one task instance to completion; returns the exit code
    async fn execute(&self, request: ExecutionRequest) -> Result<i32, ExecError>;

    /// Best-effort signal; the engine owns actual process termination
    async fn cancel(&self, task: TaskId);
}

// ============================================================================
// MOCK INVOKER
// ============================================================================

/// Failure injection for one task signature
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Exit code reported on completion
    pub exit_code: i32,
    /// Simulated execution time
    pub latency: Duration,
    /// Fail this many executions before succeeding
    pub fail_first: u32,
}

/// Test invoker: writes outputs, injects failures, honours cancels
#[derive(Default)]
pub struct MockInvoker {
    behaviors: DashMap<String, MockBehavior>,
    attempts: DashMap<String, u32>,
    executed: DashMap<TaskId, String>,
    cancels: DashMap<TaskId, Arc<Notify>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure behaviour for one signature
    pub fn behave(&self, signature: impl Into<String>, behavior: MockBehavior) {
        self.behaviors.insert(signature.into(), behavior);
    }

    /// Hosts tasks were executed on, keyed by task id
    pub fn executed_on(&self, task: TaskId) -> Option<String> {
        self.executed.get(&task).map(|h| h.clone())
    }

    pub fn execution_count(&self) -> usize {
        self.executed.len()
    }

    /// Executions attempted for one signature (retry observability)
    pub fn attempts(&self, signature: &str) -> u32 {
        self.attempts.get(signature).map(|a| *a).unwrap_or(0)
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<i32, ExecError> {
        let signature = request.task.descriptor.signature.clone();
        let behavior = self
            .behaviors
            .get(&signature)
            .map(|b| b.clone())
            .unwrap_or_default();

        let attempt = {
            let mut entry = self.attempts.entry(signature.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let cancel = Arc::new(Notify::new());
        self.cancels.insert(request.task.id, Arc::clone(&cancel));

        let run = async {
            if !behavior.latency.is_zero() {
                tokio::time::sleep(behavior.latency).await;
            }
        };
        tokio::select! {
            _ = run => {}
            _ = cancel.notified() => {
                self.cancels.remove(&request.task.id);
                return Err(ExecError::Cancelled);
            }
        }
        self.cancels.remove(&request.task.id);

        if attempt <= behavior.fail_first {
            debug!(task = %request.task.id, attempt, "Injected failure");
            return Err(ExecError::NonZeroExit(1));
        }

        // Materialize every output sink the way a worker script would
        for sink in &request.outputs {
            let content = format!("{}:{}", signature, sink.instance);
            crate::fileops::serialize_sync(content.as_bytes(), &sink.path)
                .map_err(|e| ExecError::Crashed(e.to_string()))?;
        }

        self.executed.insert(request.task.id, request.host.clone());

        if behavior.exit_code != 0 && request.task.descriptor.flags.fail_by_exit_value {
            return Err(ExecError::NonZeroExit(behavior.exit_code));
        }
        Ok(behavior.exit_code)
    }

    async fn cancel(&self, task: TaskId) {
        if let Some(notify) = self.cancels.get(&task) {
            notify.notify_waiters();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDescriptor;
    use crate::types::AppId;
    use tempfile::tempdir;

    fn request(signature: &str, outputs: Vec<OutputSink>) -> ExecutionRequest {
        ExecutionRequest {
            task: Task::new(
                TaskId::new(1),
                AppId::new(1),
                TaskDescriptor::new(signature),
                vec![],
                1,
            ),
            implementation: 0,
            host: "h1".into(),
            inputs: vec![],
            outputs,
            streams: StreamRedirection::default(),
        }
    }

    #[tokio::test]
    async fn mock_writes_output_sinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.1");
        let invoker = MockInvoker::new();

        let sink = OutputSink {
            instance: DataInstanceId::new(
                crate::types::DataId::new("out").unwrap(),
                crate::types::Version::FIRST,
            ),
            path: path.clone(),
        };
        let exit = invoker.execute(request("sig", vec![sink])).await.unwrap();
        assert_eq!(exit, 0);
        assert!(path.exists());
        assert_eq!(invoker.executed_on(TaskId::new(1)), Some("h1".into()));
    }

    #[tokio::test]
    async fn fail_first_then_succeed() {
        let invoker = MockInvoker::new();
        invoker.behave(
            "flaky",
            MockBehavior {
                fail_first: 2,
                ..MockBehavior::default()
            },
        );

        assert_eq!(
            invoker.execute(request("flaky", vec![])).await,
            Err(ExecError::NonZeroExit(1))
        );
        assert_eq!(
            invoker.execute(request("flaky", vec![])).await,
            Err(ExecError::NonZeroExit(1))
        );
        assert_eq!(invoker.execute(request("flaky", vec![])).await, Ok(0));
        assert_eq!(invoker.attempts("flaky"), 3);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_slow_task() {
        let invoker = Arc::new(MockInvoker::new());
        invoker.behave(
            "slow",
            MockBehavior {
                latency: Duration::from_secs(30),
                ..MockBehavior::default()
            },
        );

        let run = {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move { invoker.execute(request("slow", vec![])).await })
        };
        // Let the execution park on its latency first
        tokio::time::sleep(Duration::from_millis(50)).await;
        invoker.cancel(TaskId::new(1)).await;

        assert_eq!(run.await.unwrap(), Err(ExecError::Cancelled));
    }
}
