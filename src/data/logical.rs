//! Logical data store
//!
//! Per versioned instance: the set of physical replicas currently backing
//! it, an optional persistent-object binding and the number of in-flight
//! transfers targeting it. Keyed by `DataInstanceId` in a DashMap so the
//! AccessProcessor thread and transfer-completion callbacks can touch it
//! without a global lock.

use std::collections::HashSet;

use dashmap::DashMap;

use super::location::DataLocation;
use super::shared_disk::SharedDiskRegistry;
use crate::types::DataInstanceId;

/// The replica record of one immutable instance
#[derive(Debug, Clone, Default)]
pub struct LogicalData {
    /// Physical replicas (zero or more)
    pub locations: HashSet<DataLocation>,
    /// Binding to an external persistent store, if any
    pub persistent_id: Option<String>,
    /// In-flight transfers producing new replicas of this instance
    pub pending_transfers: usize,
    /// Known size in bytes; locality scoring falls back to 1 when unknown
    pub size_hint: Option<u64>,
}

/// Replica table for every live instance
#[derive(Debug, Default)]
pub struct LogicalStore {
    entries: DashMap<DataInstanceId, LogicalData>,
}

impl LogicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a replica for an instance, creating the record if needed
    pub fn add_location(&self, instance: &DataInstanceId, location: DataLocation) {
        self.entries
            .entry(instance.clone())
            .or_default()
            .locations
            .insert(location);
    }

    /// Record the known byte size of an instance
    pub fn set_size_hint(&self, instance: &DataInstanceId, bytes: u64) {
        self.entries.entry(instance.clone()).or_default().size_hint = Some(bytes);
    }

    /// Bind an instance to a persistent object
    pub fn bind_persistent(&self, instance: &DataInstanceId, object_id: impl Into<String>) {
        let mut entry = self.entries.entry(instance.clone()).or_default();
        let object_id = object_id.into();
        entry.persistent_id = Some(object_id.clone());
        entry
            .locations
            .insert(DataLocation::Persistent { object_id });
    }

    /// All replicas of an instance
    pub fn locations(&self, instance: &DataInstanceId) -> Vec<DataLocation> {
        self.entries
            .get(instance)
            .map(|e| e.locations.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replicas of an instance that `host` can open without a copy
    pub fn locations_on(
        &self,
        instance: &DataInstanceId,
        host: &str,
        disks: &SharedDiskRegistry,
    ) -> Vec<DataLocation> {
        self.entries
            .get(instance)
            .map(|e| {
                e.locations
                    .iter()
                    .filter(|loc| loc.reachable_from(host, disks))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bytes of an instance already resident on `host` (locality scoring)
    pub fn resident_bytes(
        &self,
        instance: &DataInstanceId,
        host: &str,
        disks: &SharedDiskRegistry,
    ) -> u64 {
        match self.entries.get(instance) {
            Some(e) => {
                let reachable = e
                    .locations
                    .iter()
                    .any(|loc| loc.reachable_from(host, disks));
                if reachable {
                    e.size_hint.unwrap_or(1)
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    pub fn exists(&self, instance: &DataInstanceId) -> bool {
        self.entries.contains_key(instance)
    }

    pub fn is_persistent(&self, instance: &DataInstanceId) -> bool {
        self.entries
            .get(instance)
            .map(|e| e.persistent_id.is_some())
            .unwrap_or(false)
    }

    /// Snapshot of one record
    pub fn get(&self, instance: &DataInstanceId) -> Option<LogicalData> {
        self.entries.get(instance).map(|e| e.clone())
    }

    pub fn transfer_started(&self, instance: &DataInstanceId) {
        self.entries
            .entry(instance.clone())
            .or_default()
            .pending_transfers += 1;
    }

    pub fn transfer_finished(&self, instance: &DataInstanceId) {
        if let Some(mut e) = self.entries.get_mut(instance) {
            e.pending_transfers = e.pending_transfers.saturating_sub(1);
        }
    }

    /// Forget one replica (its physical file moved away)
    pub fn remove_location(&self, instance: &DataInstanceId, location: &DataLocation) {
        if let Some(mut e) = self.entries.get_mut(instance) {
            e.locations.remove(location);
        }
    }

    /// Drop the record of an instance, returning its replicas for cleanup
    pub fn remove(&self, instance: &DataInstanceId) -> Vec<DataLocation> {
        self.entries
            .remove(instance)
            .map(|(_, e)| e.locations.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataId, Version};

    fn instance(name: &str, v: u32) -> DataInstanceId {
        DataInstanceId::new(DataId::new(name).unwrap(), Version::new(v))
    }

    #[test]
    fn add_and_list_locations() {
        let store = LogicalStore::new();
        let inst = instance("d", 1);
        store.add_location(&inst, DataLocation::private("h1", "/tmp/d.1"));
        store.add_location(&inst, DataLocation::shared("gpfs", "d.1"));
        // Duplicate insert is a no-op
        store.add_location(&inst, DataLocation::private("h1", "/tmp/d.1"));

        assert_eq!(store.locations(&inst).len(), 2);
        assert!(store.exists(&inst));
    }

    #[test]
    fn locations_on_respects_reachability() {
        let disks = SharedDiskRegistry::new();
        disks.register_mount("gpfs", "h2", "/gpfs");

        let store = LogicalStore::new();
        let inst = instance("d", 1);
        store.add_location(&inst, DataLocation::private("h1", "/tmp/d.1"));
        store.add_location(&inst, DataLocation::shared("gpfs", "d.1"));

        assert_eq!(store.locations_on(&inst, "h1", &disks).len(), 1);
        assert_eq!(store.locations_on(&inst, "h2", &disks).len(), 1);
        assert!(store.locations_on(&inst, "h3", &disks).is_empty());
    }

    #[test]
    fn resident_bytes_uses_size_hint() {
        let disks = SharedDiskRegistry::new();
        let store = LogicalStore::new();
        let inst = instance("d", 1);
        store.add_location(&inst, DataLocation::private("h1", "/tmp/d.1"));

        assert_eq!(store.resident_bytes(&inst, "h1", &disks), 1);
        store.set_size_hint(&inst, 4096);
        assert_eq!(store.resident_bytes(&inst, "h1", &disks), 4096);
        assert_eq!(store.resident_bytes(&inst, "h2", &disks), 0);
    }

    #[test]
    fn persistent_binding_adds_location() {
        let store = LogicalStore::new();
        let inst = instance("d", 1);
        store.bind_persistent(&inst, "od-9");

        assert!(store.is_persistent(&inst));
        assert_eq!(
            store.locations(&inst),
            vec![DataLocation::persistent("od-9")]
        );
    }

    #[test]
    fn pending_transfers_count() {
        let store = LogicalStore::new();
        let inst = instance("d", 1);
        store.transfer_started(&inst);
        store.transfer_started(&inst);
        assert_eq!(store.get(&inst).unwrap().pending_transfers, 2);
        store.transfer_finished(&inst);
        assert_eq!(store.get(&inst).unwrap().pending_transfers, 1);
    }

    #[test]
    fn remove_returns_replicas() {
        let store = LogicalStore::new();
        let inst = instance("d", 1);
        store.add_location(&inst, DataLocation::private("h1", "/tmp/d.1"));
        let removed = store.remove(&inst);
        assert_eq!(removed.len(), 1);
        assert!(!store.exists(&inst));
    }
}
