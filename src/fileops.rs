//! # FileOps Executor
//!
//! Local filesystem operations (copy / move / delete / serialize) behind
//! two single-consumer serial queues. HIGH runs composed operations,
//! LOW runs bulk data copies; each queue preserves strict FIFO order of
//! submission and the two never share a thread, so bursty bulk I/O cannot
//! delay a composed rename.
//!
//! Callers pick the synchronous variant (await the reply channel) or the
//! asynchronous one (fire and forget); either way the result is a single
//! `Ok | Err(kind)` message, never a callback.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

// ============================================================================
// OPERATIONS
// ============================================================================

/// Queue an operation lands on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Composed operations (renames, deletes, serialized objects)
    High,
    /// Bulk data copies
    Low,
}

/// One local filesystem operation
#[derive(Debug, Clone)]
pub enum FileOp {
    Copy {
        src: PathBuf,
        tgt: PathBuf,
        overwrite: bool,
    },
    Move {
        src: PathBuf,
        tgt: PathBuf,
        atomic_preferred: bool,
    },
    Delete {
        path: PathBuf,
    },
    Serialize {
        bytes: Vec<u8>,
        tgt: PathBuf,
    },
}

/// Typed filesystem failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileOpsError {
    /// Rename crossed a filesystem boundary
    #[error("Atomic move not supported between these paths")]
    AtomicMoveNotSupported,

    /// Single-shot removal hit a non-empty directory
    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(PathBuf),

    #[error("No such path: {0}")]
    NotFound(PathBuf),

    #[error("I/O failure on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// The executor was shut down before the operation ran
    #[error("FileOps executor is stopped")]
    ExecutorStopped,
}

fn io_err(path: &Path, e: &io::Error) -> FileOpsError {
    if e.kind() == io::ErrorKind::NotFound {
        FileOpsError::NotFound(path.to_path_buf())
    } else {
        FileOpsError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }
}

// ============================================================================
// SYNCHRONOUS PRIMITIVES
// ============================================================================

/// Copy a file, refusing to clobber unless `overwrite`
pub fn copy_sync(src: &Path, tgt: &Path, overwrite: bool) -> Result<(), FileOpsError> {
    if !overwrite && tgt.exists() {
        return Err(FileOpsError::Io {
            path: tgt.to_path_buf(),
            message: "target exists and overwrite is off".into(),
        });
    }
    if src.is_dir() {
        return copy_dir(src, tgt);
    }
    if let Some(parent) = tgt.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, &e))?;
    }
    fs::copy(src, tgt).map_err(|e| io_err(src, &e))?;
    Ok(())
}

fn copy_dir(src: &Path, tgt: &Path) -> Result<(), FileOpsError> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| FileOpsError::Io {
            path: src.to_path_buf(),
            message: e.to_string(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir stays under root");
        let dest = tgt.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| io_err(&dest, &e))?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, &e))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| io_err(entry.path(), &e))?;
        }
    }
    Ok(())
}

/// One atomic rename attempt; cross-filesystem renames are reported as
/// `AtomicMoveNotSupported` so the caller can degrade
pub fn try_atomic_move(src: &Path, tgt: &Path) -> Result<(), FileOpsError> {
    match fs::rename(src, tgt) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => Err(FileOpsError::AtomicMoveNotSupported),
        Err(e) => Err(io_err(src, &e)),
    }
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    // EXDEV
    e.raw_os_error() == Some(18)
}

#[cfg(not(unix))]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(17)
}

/// Move with the degradation ladder: atomic rename, then non-atomic
/// copy-and-delete (replace existing), then directory move
pub fn move_sync(src: &Path, tgt: &Path, atomic_preferred: bool) -> Result<(), FileOpsError> {
    if atomic_preferred {
        match try_atomic_move(src, tgt) {
            Ok(()) => return Ok(()),
            Err(FileOpsError::AtomicMoveNotSupported) => {
                debug!(src = %src.display(), tgt = %tgt.display(), "Atomic move unsupported, degrading");
            }
            Err(other) => return Err(other),
        }
    }

    // Non-atomic: copy over the target, then drop the source
    copy_sync(src, tgt, true)?;
    delete_sync(src)
}

/// Delete a path; a non-empty directory degrades to a recursive walk
pub fn delete_sync(path: &Path) -> Result<(), FileOpsError> {
    if path.is_dir() {
        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if is_not_empty(&e) => {
                debug!(path = %path.display(), "Directory not empty, deleting recursively");
                delete_recursive(path)
            }
            Err(e) => Err(io_err(path, &e)),
        }
    } else {
        fs::remove_file(path).map_err(|e| io_err(path, &e))
    }
}

fn is_not_empty(e: &io::Error) -> bool {
    // ENOTEMPTY (39 on Linux, 66 on BSD) or a kind that maps to it
    matches!(e.raw_os_error(), Some(39) | Some(66)) || e.to_string().contains("not empty")
}

fn delete_recursive(path: &Path) -> Result<(), FileOpsError> {
    for entry in WalkDir::new(path).contents_first(true) {
        let entry = entry.map_err(|e| FileOpsError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path()).map_err(|e| io_err(entry.path(), &e))?;
        } else {
            fs::remove_file(entry.path()).map_err(|e| io_err(entry.path(), &e))?;
        }
    }
    Ok(())
}

/// Write serialized bytes to the target path
pub fn serialize_sync(bytes: &[u8], tgt: &Path) -> Result<(), FileOpsError> {
    if let Some(parent) = tgt.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, &e))?;
    }
    fs::write(tgt, bytes).map_err(|e| io_err(tgt, &e))
}

/// Run one operation on the calling thread
pub fn execute_op(op: &FileOp) -> Result<(), FileOpsError> {
    match op {
        FileOp::Copy { src, tgt, overwrite } => copy_sync(src, tgt, *overwrite),
        FileOp::Move {
            src,
            tgt,
            atomic_preferred,
        } => move_sync(src, tgt, *atomic_preferred),
        FileOp::Delete { path } => delete_sync(path),
        FileOp::Serialize { bytes, tgt } => serialize_sync(bytes, tgt),
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

struct Job {
    op: FileOp,
    reply: Option<oneshot::Sender<Result<(), FileOpsError>>>,
}

/// Two-priority serial executor for local file I/O
///
/// Each priority owns one consumer task; operations inside a priority run
/// one at a time in submission order. Blocking filesystem work happens on
/// the blocking pool, awaited to completion before the next job starts.
pub struct FileOpsExecutor {
    high_tx: mpsc::UnboundedSender<Job>,
    low_tx: mpsc::UnboundedSender<Job>,
}

impl FileOpsExecutor {
    /// Spawn both queue consumers on the current tokio runtime
    pub fn start() -> Self {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::consume(high_rx, "fileops-high"));
        tokio::spawn(Self::consume(low_rx, "fileops-low"));
        Self { high_tx, low_tx }
    }

    async fn consume(rx: mpsc::UnboundedReceiver<Job>, queue: &'static str) {
        let mut stream = UnboundedReceiverStream::new(rx);
        while let Some(job) = stream.next().await {
            let op = job.op.clone();
            let result = tokio::task::spawn_blocking(move || execute_op(&op))
                .await
                .unwrap_or_else(|e| {
                    Err(FileOpsError::Io {
                        path: PathBuf::new(),
                        message: format!("blocking task panicked: {}", e),
                    })
                });

            if let Err(e) = &result {
                warn!(queue, error = %e, "File operation failed");
            }
            if let Some(reply) = job.reply {
                let _ = reply.send(result);
            }
        }
        debug!(queue, "FileOps queue drained and stopped");
    }

    fn sender(&self, priority: Priority) -> &mpsc::UnboundedSender<Job> {
        match priority {
            Priority::High => &self.high_tx,
            Priority::Low => &self.low_tx,
        }
    }

    /// Enqueue and await completion (the synchronous variant)
    pub async fn run(&self, priority: Priority, op: FileOp) -> Result<(), FileOpsError> {
        let (tx, rx) = oneshot::channel();
        self.sender(priority)
            .send(Job {
                op,
                reply: Some(tx),
            })
            .map_err(|_| FileOpsError::ExecutorStopped)?;
        rx.await.map_err(|_| FileOpsError::ExecutorStopped)?
    }

    /// Enqueue without waiting (the asynchronous variant)
    pub fn dispatch(&self, priority: Priority, op: FileOp) -> Result<(), FileOpsError> {
        self.sender(priority)
            .send(Job { op, reply: None })
            .map_err(|_| FileOpsError::ExecutorStopped)
    }

    /// Enqueue and hand back the reply channel
    pub fn submit(
        &self,
        priority: Priority,
        op: FileOp,
    ) -> Result<oneshot::Receiver<Result<(), FileOpsError>>, FileOpsError> {
        let (tx, rx) = oneshot::channel();
        self.sender(priority)
            .send(Job {
                op,
                reply: Some(tx),
            })
            .map_err(|_| FileOpsError::ExecutorStopped)?;
        Ok(rx)
    }
}

// ============================================================================
// TESTS
// ============================================================================
