//! Shared-disk topology
//!
//! One central table maps {disk ↔ hosts mounting it ↔ mount point on each
//! host}, with index maps kept in both directions. Nothing else in the
//! runtime holds disk/host cross-references; everything asks this
//! registry. Reads dominate writes (mounts change only on scale events),
//! so the whole table sits behind a single RwLock.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use crate::config::ProjectConfig;

#[derive(Debug, Default)]
struct Topology {
    /// (disk, host) -> mount point
    mounts: HashMap<(String, String), PathBuf>,
    /// host -> disks it mounts
    disks_by_host: HashMap<String, BTreeSet<String>>,
    /// disk -> hosts mounting it
    hosts_by_disk: HashMap<String, BTreeSet<String>>,
}

/// Process-wide shared-disk registry
///
/// Explicitly constructed at runtime start and dropped at teardown; a
/// handle is passed to every component that resolves locations.
#[derive(Debug, Default)]
pub struct SharedDiskRegistry {
    inner: RwLock<Topology>,
}

impl SharedDiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the topology from the project configuration
    pub fn from_project(project: &ProjectConfig) -> Self {
        let registry = Self::new();
        for disk in &project.shared_disks {
            registry.register_disk(&disk.name);
        }
        for worker in &project.workers {
            for (disk, mount) in &worker.mounts {
                registry.register_mount(disk, &worker.host, mount);
            }
        }
        registry
    }

    /// Declare a disk with no mounts yet
    pub fn register_disk(&self, disk: impl Into<String>) {
        let disk = disk.into();
        let mut topo = self.inner.write().expect("topology lock");
        topo.hosts_by_disk.entry(disk).or_default();
    }

    /// Record that `host` mounts `disk` at `mount_point`
    pub fn register_mount(
        &self,
        disk: impl Into<String>,
        host: impl Into<String>,
        mount_point: impl Into<PathBuf>,
    ) {
        let disk = disk.into();
        let host = host.into();
        let mut topo = self.inner.write().expect("topology lock");
        topo.mounts
            .insert((disk.clone(), host.clone()), mount_point.into());
        topo.disks_by_host
            .entry(host.clone())
            .or_default()
            .insert(disk.clone());
        topo.hosts_by_disk.entry(disk).or_default().insert(host);
    }

    /// Remove every mount of `host` (scale-down)
    pub fn remove_host(&self, host: &str) {
        let mut topo = self.inner.write().expect("topology lock");
        if let Some(disks) = topo.disks_by_host.remove(host) {
            for disk in disks {
                topo.mounts.remove(&(disk.clone(), host.to_string()));
                if let Some(hosts) = topo.hosts_by_disk.get_mut(&disk) {
                    hosts.remove(host);
                }
            }
        }
    }

    /// Mount point of `disk` on `host`, if mounted there
    pub fn mount_point(&self, disk: &str, host: &str) -> Option<PathBuf> {
        self.inner
            .read()
            .expect("topology lock")
            .mounts
            .get(&(disk.to_string(), host.to_string()))
            .cloned()
    }

    /// Hosts currently mounting `disk`
    pub fn hosts_mounting(&self, disk: &str) -> Vec<String> {
        self.inner
            .read()
            .expect("topology lock")
            .hosts_by_disk
            .get(disk)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Disks mounted on `host`
    pub fn disks_on(&self, host: &str) -> Vec<String> {
        self.inner
            .read()
            .expect("topology lock")
            .disks_by_host
            .get(host)
            .map(|disks| disks.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// A disk both hosts mount, if any (copy can stay inside the disk)
    pub fn common_disk(&self, host_a: &str, host_b: &str) -> Option<String> {
        let topo = self.inner.read().expect("topology lock");
        let a = topo.disks_by_host.get(host_a)?;
        let b = topo.disks_by_host.get(host_b)?;
        a.intersection(b).next().cloned()
    }
}

// ============================================================================
// TESTS
// ============================================================================
