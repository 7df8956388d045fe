//! # Vela Error Module
//!
//! Unified error handling with fix suggestions for the runtime core.
//!
//! ## Design
//!
//! Error types are NOT consolidated into one flat enum:
//!
//! 1. **Clear separation of concerns**:
//!    - `types.rs` errors: identity validation (DataId, group names)
//!    - `data/` errors: location parsing and version bookkeeping
//!    - `fileops.rs` / `transfer.rs` errors: I/O and data movement
//!    - `scheduler/` / `app.rs` errors: dispatch and lifecycle
//! 2. **Each layer has different consumers** (bindings see data errors,
//!    operators see config errors, invokers see exec errors)
//! 3. **thiserror already provides `std::error::Error`**
//!
//! Instead, this module provides:
//! - A `FixSuggestion` trait for unified fix suggestion access
//! - A `RuntimeError` enum wrapping the specific errors for the API surface
//!
//! Every kind stays a tagged value end to end; nothing is stringly typed
//! until it reaches a display helper.

use thiserror::Error;

use crate::types::{AppId, DataId, TaskId};

// ============================================================================
// FIX SUGGESTION TRAIT
// ============================================================================

/// Trait for errors that can provide fix suggestions
///
/// All runtime errors should implement this trait to provide operators
/// with guidance on how to resolve the error.
pub trait FixSuggestion {
    /// Get a fix suggestion for this error, if available
    fn fix_suggestion(&self) -> Option<&str>;
}

// ============================================================================
// RUNTIME ERROR (Top-level API Error)
// ============================================================================

/// Top-level error type for the runtime API surface
///
/// Wraps the specific error types from the subsystems, providing a unified
/// interface for language bindings and launchers.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Data identity validation error
    #[error("{0}")]
    DataId(#[from] crate::types::DataIdError),

    /// Task group name validation error
    #[error("{0}")]
    GroupName(#[from] crate::types::GroupNameError),

    /// Physical location parsing error
    #[error("{0}")]
    Location(#[from] crate::data::location::LocationError),

    /// Data version bookkeeping error
    #[error("{0}")]
    Data(#[from] crate::data::info::DataError),

    /// Local filesystem operation error
    #[error("{0}")]
    FileOps(#[from] crate::fileops::FileOpsError),

    /// Inter-host transfer error
    #[error("{0}")]
    Transfer(#[from] crate::transfer::TransferError),

    /// Scheduling error
    #[error("{0}")]
    Schedule(#[from] crate::scheduler::ScheduleError),

    /// Application lifecycle error
    #[error("{0}")]
    App(#[from] crate::app::AppError),

    /// Request queue error
    #[error("{0}")]
    Access(#[from] crate::access::ApError),

    /// Task execution error reported by an invoker
    #[error("{0}")]
    Exec(#[from] crate::invoker::ExecError),

    /// Startup configuration error
    #[error("{0}")]
    Config(#[from] crate::config::ConfigError),

    /// IO error (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Create a generic error with a message
    pub fn other(msg: impl Into<String>) -> Self {
        RuntimeError::Other(msg.into())
    }

    /// True when the error means the runtime refuses further submissions
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            RuntimeError::Access(crate::access::ApError::ShutdownInProgress)
        )
    }
}

impl FixSuggestion for RuntimeError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            RuntimeError::DataId(e) => e.fix_suggestion(),
            RuntimeError::GroupName(e) => e.fix_suggestion(),
            RuntimeError::Location(e) => e.fix_suggestion(),
            RuntimeError::Data(e) => e.fix_suggestion(),
            RuntimeError::FileOps(e) => e.fix_suggestion(),
            RuntimeError::Transfer(e) => e.fix_suggestion(),
            RuntimeError::Schedule(e) => e.fix_suggestion(),
            RuntimeError::App(e) => e.fix_suggestion(),
            RuntimeError::Access(e) => e.fix_suggestion(),
            RuntimeError::Exec(e) => e.fix_suggestion(),
            RuntimeError::Config(e) => e.fix_suggestion(),
            RuntimeError::Io(_) => Some("Check file path exists and has correct permissions"),
            RuntimeError::Other(_) => None,
        }
    }
}

// ============================================================================
// FIX SUGGESTION IMPLEMENTATIONS
// ============================================================================

impl FixSuggestion for crate::types::DataIdError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::types::DataIdError;

        Some(match self {
            DataIdError::Empty => "Example: 'matrix_a', 'results/block.dat'",
            DataIdError::TooLong(_) => "Keep data identities concise (max 255 chars)",
            DataIdError::InvalidCharacters(_) => {
                "Replace special chars: 'my var' -> 'my_var'; only [A-Za-z0-9_-./~] allowed"
            }
        })
    }
}

impl FixSuggestion for crate::types::GroupNameError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::types::GroupNameError;

        Some(match self {
            GroupNameError::Empty => "Example: 'phase-1', 'reduction'",
        })
    }
}

impl FixSuggestion for crate::data::location::LocationError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::data::location::LocationError;

        Some(match self {
            LocationError::InvalidUri { .. } => {
                "Use 'file://host/abs/path', 'shared://disk/rel/path' or 'object://id'"
            }
            LocationError::UnsupportedScheme(_) => {
                "Supported schemes: file://, shared://, object://"
            }
            LocationError::NotAbsolute(_) => "Private locations need an absolute path",
            LocationError::MissingHost => "Private locations need a host component",
            LocationError::MissingDisk => "Shared locations need a disk name component",
        })
    }
}

impl FixSuggestion for crate::data::info::DataError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::data::info::DataError;

        Some(match self {
            DataError::NotFound(_) => {
                "Register the datum or submit a task that writes it before reading"
            }
            DataError::AlreadyRegistered(_) => {
                "registerData is one-shot per identity; reuse the existing handle"
            }
        })
    }
}

impl FixSuggestion for crate::fileops::FileOpsError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::fileops::FileOpsError;

        Some(match self {
            FileOpsError::AtomicMoveNotSupported => {
                "Source and target are on different filesystems; the executor retries non-atomically"
            }
            FileOpsError::DirectoryNotEmpty(_) => {
                "The executor falls back to a recursive directory operation"
            }
            FileOpsError::NotFound(_) => "Check the source path still exists on this host",
            FileOpsError::Io { .. } => "Check disk space and permissions on the affected host",
            FileOpsError::ExecutorStopped => "The runtime is shutting down; no new I/O is accepted",
        })
    }
}

impl FixSuggestion for crate::transfer::TransferError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::transfer::TransferError;

        Some(match self {
            TransferError::NoRoute { .. } => {
                "No replica is reachable from the target host; check shared-disk mounts"
            }
            TransferError::SourceVanished(_) => {
                "All source replicas disappeared mid-transfer; the scheduler re-plans"
            }
            TransferError::Backend { .. } => "Check connectivity between the involved hosts",
            TransferError::FileOps(e) => return e.fix_suggestion(),
        })
    }
}

impl FixSuggestion for crate::scheduler::ScheduleError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::scheduler::ScheduleError;

        Some(match self {
            ScheduleError::ConstraintUnsatisfiable(_) => {
                "No declared worker can ever match these constraints; lower them or add workers"
            }
            ScheduleError::Blocked(_) => {
                "Every remaining task waits on capacity no current worker offers"
            }
            ScheduleError::UnknownResource(_) => "The worker left the pool; resubmit or scale up",
        })
    }
}

impl FixSuggestion for crate::app::AppError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::app::AppError;

        Some(match self {
            AppError::Unknown(_) => "Register the application before submitting work for it",
            AppError::Cancelled(_) => "The application was cancelled; pending waits are released",
            AppError::SubmissionClosed(_) => {
                "endOfApp was already requested; no further submissions are accepted"
            }
            AppError::Failed(_) => {
                "A Fail-policy task did not complete; inspect its logs on the worker"
            }
        })
    }
}

impl FixSuggestion for crate::access::ApError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::access::ApError;

        Some(match self {
            ApError::ShutdownInProgress => {
                "The runtime is stopping; finish or cancel applications first"
            }
            ApError::ReplyDropped => "Internal consumer dropped the reply; check runtime logs",
        })
    }
}

impl FixSuggestion for crate::invoker::ExecError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::invoker::ExecError;

        Some(match self {
            ExecError::NonZeroExit(_) => {
                "The task binary exited non-zero; inspect its stderr on the worker"
            }
            ExecError::Crashed(_) => "The execution engine reported a crash; check worker health",
            ExecError::Timeout => "Increase the task timeout or split the task",
            ExecError::Cancelled => "The task was cancelled by an application-level cancel",
        })
    }
}

impl FixSuggestion for crate::config::ConfigError {
    fn fix_suggestion(&self) -> Option<&str> {
        use crate::config::ConfigError;

        Some(match self {
            ConfigError::MissingHome => "Set VELA_HOME to the install root",
            ConfigError::SchemaFailed { .. } => {
                "Fix the project/resources file so it validates against the embedded schema"
            }
            ConfigError::Parse(_) => "Check YAML syntax: ensure proper indentation and quoting",
            ConfigError::UnknownScheduler(_) => {
                "Valid selectors: LoadBalancing, FIFO, LIFO, FIFOData, FIFODataLocation, Base"
            }
            ConfigError::Io(_) => "Check the configuration file paths",
        })
    }
}

// ============================================================================
// DISPLAY HELPERS
// ============================================================================

/// Format an error with its fix suggestion for display
pub fn format_error_with_suggestion<E: std::error::Error + FixSuggestion>(error: &E) -> String {
    let mut result = error.to_string();
    if let Some(suggestion) = error.fix_suggestion() {
        result.push_str("\n  Fix: ");
        result.push_str(suggestion);
    }
    result
}

/// Print an error with its fix suggestion to stderr
pub fn print_error<E: std::error::Error + FixSuggestion>(error: &E) {
    eprintln!("Error: {}", error);
    if let Some(suggestion) = error.fix_suggestion() {
        eprintln!("  Fix: {}", suggestion);
    }
}

/// Terminal status of a task execution, as handed to the failure policies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Completed with a success exit
    Finished,
    /// Execution failed with a tagged cause
    Failed(FailureCause),
    /// Cancelled before or during execution
    Cancelled,
}

/// Why a task stopped without finishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// Invoker reported a non-zero exit and the task runs with fail_by_exit_value
    ExitValue(i32),
    /// Engine-level crash on the worker
    Crashed,
    /// An input replica could not be produced on the executing host
    InputUnavailable(DataId),
    /// The per-task timeout elapsed after dispatch
    Timeout,
    /// A predecessor failed under CancelSuccessors
    PredecessorFailed(TaskId),
    /// The owning application was cancelled
    AppCancelled(AppId),
}

// ============================================================================
// TESTS
// ============================================================================
