//! # Transfer Orchestrator
//!
//! Resolves "instance X must be readable on host H" into the cheapest
//! available plan, in order:
//!
//! 1. A replica is already reachable from H (shared disk or local) - no copy
//! 2. Source and target are the same host - local copy, or move when no
//!    other reader needs the source
//! 3. Source and target host share a disk - one copy scoped to that disk
//! 4. Anything else - remote copy through the backend
//!
//! Concurrent requests for the same (instance, target host) coalesce into
//! one physical copy; every caller observes the same result. Failed
//! copies retry against the remaining source replicas before giving up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::data::location::DataLocation;
use crate::data::logical::LogicalStore;
use crate::data::shared_disk::SharedDiskRegistry;
use crate::fileops::{FileOp, FileOpsError, FileOpsExecutor, Priority};
use crate::types::DataInstanceId;

// ============================================================================
// ERRORS
// ============================================================================

/// Inter-host transfer failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("No replica of {instance} is reachable from or routable to '{host}'")]
    NoRoute {
        instance: DataInstanceId,
        host: String,
    },

    #[error("Every source replica of {0} disappeared mid-transfer")]
    SourceVanished(DataInstanceId),

    #[error("Transfer backend failure: {message}")]
    Backend { message: String },

    #[error("{0}")]
    FileOps(#[from] FileOpsError),
}

// ============================================================================
// BACKEND SEAM
// ============================================================================

/// The copy primitives the orchestrator plans over
///
/// Production backends wrap SSH/scp connectors; the in-tree
/// [`LocalBackend`] drives everything through the FileOps executor so a
/// single machine can stand in for a fleet.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Copy or move within one host
    async fn copy_local(
        &self,
        host: &str,
        src: &Path,
        tgt: &Path,
        move_source: bool,
    ) -> Result<(), TransferError>;

    /// Copy across hosts (the on-wire case)
    async fn copy_remote(
        &self,
        src_host: &str,
        src: &Path,
        tgt_host: &str,
        tgt: &Path,
    ) -> Result<(), TransferError>;

    /// Materialize serialized bytes at a path on a host
    async fn serialize(&self, host: &str, bytes: Vec<u8>, tgt: &Path)
        -> Result<(), TransferError>;
}

/// Backend for single-machine fleets: every "host" is a local directory
///
/// Counts its operations so tests can assert how many bytes actually
/// moved (the shared-disk shortcut must produce zero).
pub struct LocalBackend {
    fileops: Arc<FileOpsExecutor>,
    local_copies: std::sync::atomic::AtomicUsize,
    remote_copies: std::sync::atomic::AtomicUsize,
}

impl LocalBackend {
    pub fn new(fileops: Arc<FileOpsExecutor>) -> Self {
        Self {
            fileops,
            local_copies: Default::default(),
            remote_copies: Default::default(),
        }
    }

    pub fn local_copies(&self) -> usize {
        self.local_copies.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn remote_copies(&self) -> usize {
        self.remote_copies.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferBackend for LocalBackend {
    async fn copy_local(
        &self,
        _host: &str,
        src: &Path,
        tgt: &Path,
        move_source: bool,
    ) -> Result<(), TransferError> {
        self.local_copies
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let op = if move_source {
            FileOp::Move {
                src: src.to_path_buf(),
                tgt: tgt.to_path_buf(),
                atomic_preferred: true,
            }
        } else {
            FileOp::Copy {
                src: src.to_path_buf(),
                tgt: tgt.to_path_buf(),
                overwrite: true,
            }
        };
        // Composed rename goes HIGH, bulk copy goes LOW
        let priority = if move_source {
            Priority::High
        } else {
            Priority::Low
        };
        self.fileops.run(priority, op).await?;
        Ok(())
    }

    async fn copy_remote(
        &self,
        _src_host: &str,
        src: &Path,
        _tgt_host: &str,
        tgt: &Path,
    ) -> Result<(), TransferError> {
        self.remote_copies
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.fileops
            .run(
                Priority::Low,
                FileOp::Copy {
                    src: src.to_path_buf(),
                    tgt: tgt.to_path_buf(),
                    overwrite: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn serialize(
        &self,
        _host: &str,
        bytes: Vec<u8>,
        tgt: &Path,
    ) -> Result<(), TransferError> {
        self.fileops
            .run(
                Priority::High,
                FileOp::Serialize {
                    bytes,
                    tgt: tgt.to_path_buf(),
                },
            )
            .await?;
        Ok(())
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

type TransferResult = Result<DataLocation, TransferError>;
type InflightKey = (DataInstanceId, String);

/// Plans and executes the copies that stage task inputs
pub struct TransferOrchestrator {
    store: Arc<LogicalStore>,
    disks: Arc<SharedDiskRegistry>,
    backend: Arc<dyn TransferBackend>,
    /// One slot per (instance, target host); concurrent requests attach
    inflight: DashMap<InflightKey, watch::Receiver<Option<TransferResult>>>,
}

impl TransferOrchestrator {
    pub fn new(
        store: Arc<LogicalStore>,
        disks: Arc<SharedDiskRegistry>,
        backend: Arc<dyn TransferBackend>,
    ) -> Self {
        Self {
            store,
            disks,
            backend,
            inflight: DashMap::new(),
        }
    }

    /// Make `instance` readable on `host`, staging into `tgt` if a copy
    /// is needed; returns the location the reader should open
    ///
    /// `preserve_source` forbids consuming the source replica (other
    /// readers still need it).
    #[instrument(skip(self), fields(instance = %instance, host))]
    pub async fn request(
        &self,
        instance: &DataInstanceId,
        host: &str,
        tgt: &Path,
        preserve_source: bool,
    ) -> TransferResult {
        // Plan step 1: something reachable already exists
        if let Some(resident) = self.pick_resident(instance, host) {
            debug!(location = %resident, "Replica already reachable, no copy");
            return Ok(resident);
        }

        let key = (instance.clone(), host.to_string());

        // Attach to an in-flight copy for this pair, if any
        let (tx, run_here) = {
            match self.inflight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(e) => {
                    let mut rx = e.get().clone();
                    drop(e);
                    debug!("Coalescing onto in-flight transfer");
                    loop {
                        if let Some(result) = rx.borrow().clone() {
                            return result;
                        }
                        if rx.changed().await.is_err() {
                            return Err(TransferError::SourceVanished(instance.clone()));
                        }
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    let (tx, rx) = watch::channel(None);
                    e.insert(rx);
                    (tx, true)
                }
            }
        };
        debug_assert!(run_here);

        // Double check after winning the slot: a transfer that completed
        // between the residency check and the insert left a replica behind
        if let Some(resident) = self.pick_resident(instance, host) {
            let _ = tx.send(Some(Ok(resident.clone())));
            self.inflight.remove(&key);
            return Ok(resident);
        }

        self.store.transfer_started(instance);
        let result = self.perform(instance, host, tgt, preserve_source).await;
        self.store.transfer_finished(instance);

        let _ = tx.send(Some(result.clone()));
        self.inflight.remove(&key);
        result
    }

    /// A replica `host` can open without any copy, if one exists
    fn pick_resident(&self, instance: &DataInstanceId, host: &str) -> Option<DataLocation> {
        let mut reachable = self.store.locations_on(instance, host, &self.disks);
        // Prefer concrete filesystem replicas over the persistent binding
        reachable.sort_by_key(|loc| matches!(loc, DataLocation::Persistent { .. }));
        reachable.into_iter().next()
    }

    /// Plan steps 2-4, retrying across source replicas
    async fn perform(
        &self,
        instance: &DataInstanceId,
        host: &str,
        tgt: &Path,
        preserve_source: bool,
    ) -> TransferResult {
        let sources = self.store.locations(instance);
        if sources.is_empty() {
            return Err(TransferError::NoRoute {
                instance: instance.clone(),
                host: host.to_string(),
            });
        }

        let mut last_error = None;
        for source in &sources {
            // Resolve the source to a concrete (host, path) pair
            let (src_host, src_path) = match source {
                DataLocation::Private { host, path } => (host.clone(), path.clone()),
                DataLocation::Shared { disk, path } => {
                    let Some(holder) = self.disks.hosts_mounting(disk).into_iter().next() else {
                        continue;
                    };
                    let Some(mount) = self.disks.mount_point(disk, &holder) else {
                        continue;
                    };
                    (holder, mount.join(path))
                }
                DataLocation::Persistent { .. } => continue,
            };
            let (src_host, src_path) = (src_host.as_str(), src_path.as_path());

            let attempt = if src_host == host {
                // Plan step 2: same host; move unless other readers remain
                self.local_stage(instance, source, host, src_path, tgt, preserve_source)
                    .await
            } else if let Some(disk) = self.disks.common_disk(src_host, host) {
                // Plan step 3: stage onto the common disk once
                self.disk_stage(instance, src_host, src_path, &disk).await
            } else {
                // Plan step 4: on-wire copy
                self.remote_stage(instance, src_host, src_path, host, tgt)
                    .await
            };

            match attempt {
                Ok(location) => return Ok(location),
                Err(e) => {
                    warn!(source = %source, error = %e, "Source failed, trying alternatives");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(_) => Err(TransferError::SourceVanished(instance.clone())),
            None => Err(TransferError::NoRoute {
                instance: instance.clone(),
                host: host.to_string(),
            }),
        }
    }

    async fn local_stage(
        &self,
        instance: &DataInstanceId,
        source: &DataLocation,
        host: &str,
        src_path: &Path,
        tgt: &Path,
        preserve_source: bool,
    ) -> TransferResult {
        let move_source = !preserve_source;
        self.backend
            .copy_local(host, src_path, tgt, move_source)
            .await?;
        if move_source {
            self.store.remove_location(instance, source);
        }
        let location = DataLocation::private(host, tgt);
        self.store.add_location(instance, location.clone());
        Ok(location)
    }

    async fn disk_stage(
        &self,
        instance: &DataInstanceId,
        src_host: &str,
        src_path: &Path,
        disk: &str,
    ) -> TransferResult {
        let rel = PathBuf::from(instance.file_name());
        let mount = self
            .disks
            .mount_point(disk, src_host)
            .ok_or_else(|| TransferError::Backend {
                message: format!("disk '{}' vanished from '{}'", disk, src_host),
            })?;
        self.backend
            .copy_local(src_host, src_path, &mount.join(&rel), false)
            .await?;
        let location = DataLocation::shared(disk, rel);
        self.store.add_location(instance, location.clone());
        Ok(location)
    }

    async fn remote_stage(
        &self,
        instance: &DataInstanceId,
        src_host: &str,
        src_path: &Path,
        tgt_host: &str,
        tgt: &Path,
    ) -> TransferResult {
        self.backend
            .copy_remote(src_host, src_path, tgt_host, tgt)
            .await?;
        let location = DataLocation::private(tgt_host, tgt);
        self.store.add_location(instance, location.clone());
        Ok(location)
    }

    /// Materialize an object's bytes on a host (serialized task results)
    pub async fn serialize(
        &self,
        instance: &DataInstanceId,
        host: &str,
        bytes: Vec<u8>,
        tgt: &Path,
    ) -> TransferResult {
        self.backend.serialize(host, bytes, tgt).await?;
        let location = DataLocation::private(host, tgt);
        self.store.add_location(instance, location.clone());
        Ok(location)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataId, Version};
    use std::fs;
    use tempfile::tempdir;

    fn instance(name: &str) -> DataInstanceId {
        DataInstanceId::new(DataId::new(name).unwrap(), Version::FIRST)
    }

    struct Fixture {
        orchestrator: TransferOrchestrator,
        backend: Arc<LocalBackend>,
        store: Arc<LogicalStore>,
        disks: Arc<SharedDiskRegistry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LogicalStore::new());
        let disks = Arc::new(SharedDiskRegistry::new());
        let backend = Arc::new(LocalBackend::new(Arc::new(FileOpsExecutor::start())));
        let orchestrator = TransferOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&disks),
            backend.clone() as Arc<dyn TransferBackend>,
        );
        Fixture {
            orchestrator,
            backend,
            store,
            disks,
        }
    }

    #[tokio::test]
    async fn shared_disk_replica_needs_no_copy() {
        let fx = fixture();
        fx.disks.register_mount("gpfs", "h1", "/gpfs");
        fx.disks.register_mount("gpfs", "h2", "/mnt/gpfs");

        let inst = instance("f");
        fx.store
            .add_location(&inst, DataLocation::shared("gpfs", "f.1"));

        let location = fx
            .orchestrator
            .request(&inst, "h2", Path::new("/sandbox/f.1"), true)
            .await
            .unwrap();

        assert_eq!(location, DataLocation::shared("gpfs", "f.1"));
        assert_eq!(fx.backend.local_copies(), 0, "zero bytes moved");
        assert_eq!(fx.backend.remote_copies(), 0);
    }

    #[tokio::test]
    async fn same_host_read_write_copies_when_source_preserved() {
        let fx = fixture();
        let dir = tempdir().unwrap();
        let src = dir.path().join("d.1");
        let tgt = dir.path().join("sandbox/d.1");
        fs::write(&src, b"payload").unwrap();

        let inst = instance("d");
        fx.store
            .add_location(&inst, DataLocation::private("h1", &src));

        let location = fx
            .orchestrator
            .request(&inst, "h1", &tgt, true)
            .await
            .unwrap();

        assert_eq!(location, DataLocation::private("h1", &tgt));
        assert!(src.exists(), "preserved source must survive");
        assert!(tgt.exists());
        // Both the original and the staged replica are registered
        assert_eq!(fx.store.locations(&inst).len(), 2);
    }

    #[tokio::test]
    async fn same_host_sole_reader_moves_the_source() {
        let fx = fixture();
        let dir = tempdir().unwrap();
        let src = dir.path().join("d.1");
        let tgt = dir.path().join("sandbox/d.1");
        fs::write(&src, b"payload").unwrap();

        let inst = instance("d");
        fx.store
            .add_location(&inst, DataLocation::private("h1", &src));

        fx.orchestrator
            .request(&inst, "h1", &tgt, false)
            .await
            .unwrap();

        assert!(!src.exists(), "sole reader consumes the source");
        assert!(tgt.exists());
        assert_eq!(
            fx.store.locations(&inst),
            vec![DataLocation::private("h1", &tgt)]
        );
    }

    #[tokio::test]
    async fn disjoint_hosts_copy_on_wire() {
        let fx = fixture();
        let dir = tempdir().unwrap();
        let src = dir.path().join("d.1");
        let tgt = dir.path().join("remote/d.1");
        fs::write(&src, b"payload").unwrap();

        let inst = instance("d");
        fx.store
            .add_location(&inst, DataLocation::private("h1", &src));

        let location = fx
            .orchestrator
            .request(&inst, "h2", &tgt, true)
            .await
            .unwrap();

        assert_eq!(location, DataLocation::private("h2", &tgt));
        assert_eq!(fx.backend.remote_copies(), 1);
    }

    #[tokio::test]
    async fn missing_instance_has_no_route() {
        let fx = fixture();
        let err = fx
            .orchestrator
            .request(&instance("ghost"), "h1", Path::new("/tmp/x"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NoRoute { .. }));
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce_to_one_copy() {
        let fx = fixture();
        let dir = tempdir().unwrap();
        let src = dir.path().join("d.1");
        let tgt = dir.path().join("remote/d.1");
        fs::write(&src, b"payload").unwrap();

        let inst = instance("d");
        fx.store
            .add_location(&inst, DataLocation::private("h1", &src));

        let orchestrator = Arc::new(fx.orchestrator);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let orch = Arc::clone(&orchestrator);
            let inst = inst.clone();
            let tgt = tgt.clone();
            handles.push(tokio::spawn(async move {
                orch.request(&inst, "h2", &tgt, true).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(
            fx.backend.remote_copies(),
            1,
            "eight requests, one on-wire copy"
        );
    }
}
