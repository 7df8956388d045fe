//! Access versioning
//!
//! Every access a task declares on a logical datum passes through the
//! `DataInfoProvider`, which assigns the read/written instance versions
//! and tracks live readers per version. Superseded versions with no
//! readers become eviction candidates the moment they die; versions under
//! deletion wait for their last reader.
//!
//! All methods run on the AccessProcessor thread, so the record table is
//! a plain HashMap.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use super::location::DataLocation;
use super::logical::LogicalStore;
use crate::types::{DataId, DataInstanceId, Version};

// ============================================================================
// ACCESS TYPES
// ============================================================================

/// Declared direction of one task parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Pure read
    In,
    /// Pure write
    Out,
    /// Read then write
    InOut,
}

/// The versioned result of registering one access
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataAccess {
    /// Pure read; the source instance is preserved
    Read { instance: DataInstanceId },
    /// Pure write; no input
    Write { instance: DataInstanceId },
    /// Read version v, write version v+1
    ReadWrite {
        read: DataInstanceId,
        written: DataInstanceId,
        /// True iff other readers of the read instance exist, so the
        /// transfer layer must copy rather than move the source
        preserve_source: bool,
    },
}

impl DataAccess {
    /// The instance this access reads, if any
    pub fn read_instance(&self) -> Option<&DataInstanceId> {
        match self {
            Self::Read { instance } => Some(instance),
            Self::ReadWrite { read, .. } => Some(read),
            Self::Write { .. } => None,
        }
    }

    /// The instance this access writes, if any
    pub fn written_instance(&self) -> Option<&DataInstanceId> {
        match self {
            Self::Write { instance } => Some(instance),
            Self::ReadWrite { written, .. } => Some(written),
            Self::Read { .. } => None,
        }
    }

    pub fn preserve_source(&self) -> bool {
        matches!(
            self,
            Self::ReadWrite {
                preserve_source: true,
                ..
            }
        )
    }
}

/// Data version bookkeeping errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Unknown data identity: '{0}' was never written or registered")]
    NotFound(DataId),

    #[error("Data identity '{0}' is already registered")]
    AlreadyRegistered(DataId),
}

/// Result of a delete request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The datum is gone; these instances need physical cleanup
    Deleted(Vec<DataInstanceId>),
    /// Readers remain; the delete runs when the last one finishes
    Deferred,
}

// ============================================================================
// PROVIDER
// ============================================================================

#[derive(Debug, Default)]
struct DataRecord {
    current: Version,
    /// Live reader count per version; absent means zero
    readers: HashMap<Version, usize>,
    delete_requested: bool,
}

impl DataRecord {
    fn total_readers(&self) -> usize {
        self.readers.values().sum()
    }
}

/// Versions each data identity on every access
#[derive(Debug)]
pub struct DataInfoProvider {
    records: HashMap<DataId, DataRecord>,
    store: Arc<LogicalStore>,
}

impl DataInfoProvider {
    pub fn new(store: Arc<LogicalStore>) -> Self {
        Self {
            records: HashMap::new(),
            store,
        }
    }

    /// Register a datum with a caller-provided initial replica
    pub fn register(
        &mut self,
        data: DataId,
        initial: Option<DataLocation>,
    ) -> Result<DataInstanceId, DataError> {
        if self.records.contains_key(&data) {
            return Err(DataError::AlreadyRegistered(data));
        }
        let record = DataRecord {
            current: Version::FIRST,
            ..DataRecord::default()
        };
        self.records.insert(data.clone(), record);

        let instance = DataInstanceId::new(data, Version::FIRST);
        if let Some(location) = initial {
            self.store.add_location(&instance, location);
        }
        debug!(instance = %instance, "Registered datum");
        Ok(instance)
    }

    /// Version one access; returns the access plus any instance whose last
    /// hold just vanished (ready for physical eviction)
    pub fn register_access(
        &mut self,
        data: &DataId,
        direction: Direction,
    ) -> Result<(DataAccess, Vec<DataInstanceId>), DataError> {
        match direction {
            Direction::In => {
                let record = self
                    .records
                    .get_mut(data)
                    .ok_or_else(|| DataError::NotFound(data.clone()))?;
                let instance = DataInstanceId::new(data.clone(), record.current);
                *record.readers.entry(record.current).or_insert(0) += 1;
                trace!(instance = %instance, "Read access");
                Ok((DataAccess::Read { instance }, Vec::new()))
            }
            Direction::Out => {
                let mut evictions = Vec::new();
                let record = self.records.entry(data.clone()).or_default();
                let written = if record.current == Version::new(0) {
                    Version::FIRST
                } else {
                    let prior = DataInstanceId::new(data.clone(), record.current);
                    if record.readers.get(&record.current).copied().unwrap_or(0) == 0
                        && !self.store.is_persistent(&prior)
                        && self.store.exists(&prior)
                    {
                        evictions.push(prior);
                    }
                    record.current.next()
                };
                record.current = written;
                let instance = DataInstanceId::new(data.clone(), written);
                trace!(instance = %instance, "Write access");
                Ok((DataAccess::Write { instance }, evictions))
            }
            Direction::InOut => {
                let record = self
                    .records
                    .get_mut(data)
                    .ok_or_else(|| DataError::NotFound(data.clone()))?;
                let read = DataInstanceId::new(data.clone(), record.current);
                let reader_count = record.readers.entry(record.current).or_insert(0);
                *reader_count += 1;
                let preserve_source = *reader_count > 1;

                let written_version = record.current.next();
                record.current = written_version;
                let written = DataInstanceId::new(data.clone(), written_version);
                trace!(read = %read, written = %written, preserve_source, "Read-write access");
                Ok((
                    DataAccess::ReadWrite {
                        read,
                        written,
                        preserve_source,
                    },
                    Vec::new(),
                ))
            }
        }
    }

    /// A reader of `instance` finished; returns instances to evict
    pub fn reader_done(&mut self, instance: &DataInstanceId) -> Vec<DataInstanceId> {
        let (superseded, fire_delete) = {
            let Some(record) = self.records.get_mut(&instance.data) else {
                return Vec::new();
            };

            if let Some(count) = record.readers.get_mut(&instance.version) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    record.readers.remove(&instance.version);
                }
            }

            (
                instance.version < record.current
                    && !record.readers.contains_key(&instance.version),
                record.delete_requested && record.total_readers() == 0,
            )
        };

        let mut evictions = Vec::new();

        // A superseded version with no readers is dead
        if superseded && !self.store.is_persistent(instance) {
            evictions.push(instance.clone());
        }

        // A deferred delete fires when the last reader leaves
        if fire_delete {
            if let Ok(DeleteOutcome::Deleted(rest)) = self.delete(&instance.data) {
                for inst in rest {
                    if !evictions.contains(&inst) {
                        evictions.push(inst);
                    }
                }
            }
        }

        evictions
    }

    /// Delete a datum now, or defer until its readers finish
    pub fn delete(&mut self, data: &DataId) -> Result<DeleteOutcome, DataError> {
        let record = self
            .records
            .get_mut(data)
            .ok_or_else(|| DataError::NotFound(data.clone()))?;

        if record.total_readers() > 0 {
            record.delete_requested = true;
            debug!(data = %data, "Delete deferred until readers finish");
            return Ok(DeleteOutcome::Deferred);
        }

        let record = self.records.remove(data).expect("record present");
        let mut instances: Vec<DataInstanceId> = record
            .readers
            .keys()
            .map(|v| DataInstanceId::new(data.clone(), *v))
            .collect();
        let current = DataInstanceId::new(data.clone(), record.current);
        if !instances.contains(&current) {
            instances.push(current);
        }
        debug!(data = %data, instances = instances.len(), "Deleted datum");
        Ok(DeleteOutcome::Deleted(instances))
    }

    /// Current version of a datum, if known
    pub fn current_version(&self, data: &DataId) -> Option<Version> {
        self.records.get(data).map(|r| r.current)
    }

    /// Live readers of one instance
    pub fn readers(&self, instance: &DataInstanceId) -> usize {
        self.records
            .get(&instance.data)
            .and_then(|r| r.readers.get(&instance.version))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_known(&self, data: &DataId) -> bool {
        self.records.contains_key(data)
    }

    pub fn store(&self) -> &Arc<LogicalStore> {
        &self.store
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> DataInfoProvider {
        DataInfoProvider::new(Arc::new(LogicalStore::new()))
    }

    fn data(name: &str) -> DataId {
        DataId::new(name).unwrap()
    }

    #[test]
    fn read_of_unknown_datum_fails() {
        let mut dip = provider();
        let err = dip.register_access(&data("d"), Direction::In).unwrap_err();
        assert!(matches!(err, DataError::NotFound(_)));
    }

    #[test]
    fn first_write_registers_version_one() {
        let mut dip = provider();
        let (access, evictions) = dip.register_access(&data("d"), Direction::Out).unwrap();
        assert_eq!(
            access.written_instance().unwrap().version,
            Version::FIRST
        );
        assert!(evictions.is_empty());
    }

    #[test]
    fn current_version_counts_writes() {
        // Invariant: currentVersion == number of W plus RW accesses
        let mut dip = provider();
        let d = data("d");
        dip.register_access(&d, Direction::Out).unwrap();
        dip.register_access(&d, Direction::Out).unwrap();
        dip.register_access(&d, Direction::InOut).unwrap();
        dip.register_access(&d, Direction::In).unwrap();
        assert_eq!(dip.current_version(&d), Some(Version::new(3)));
    }

    #[test]
    fn read_write_chains_versions() {
        let mut dip = provider();
        let d = data("d");
        dip.register_access(&d, Direction::Out).unwrap();
        let (access, _) = dip.register_access(&d, Direction::InOut).unwrap();
        match access {
            DataAccess::ReadWrite {
                read,
                written,
                preserve_source,
            } => {
                assert_eq!(read.version, Version::new(1));
                assert_eq!(written.version, Version::new(2));
                assert!(!preserve_source, "sole reader keeps no source");
            }
            other => panic!("expected ReadWrite, got {:?}", other),
        }
    }

    #[test]
    fn preserve_source_set_with_other_readers() {
        let mut dip = provider();
        let d = data("d");
        dip.register_access(&d, Direction::Out).unwrap();
        dip.register_access(&d, Direction::In).unwrap();
        dip.register_access(&d, Direction::In).unwrap();
        let (access, _) = dip.register_access(&d, Direction::InOut).unwrap();
        assert!(access.preserve_source());
    }

    #[test]
    fn superseded_version_evicted_when_readerless() {
        let store = Arc::new(LogicalStore::new());
        let mut dip = DataInfoProvider::new(Arc::clone(&store));
        let d = data("d");

        dip.register_access(&d, Direction::Out).unwrap();
        let v1 = DataInstanceId::new(d.clone(), Version::FIRST);
        store.add_location(&v1, DataLocation::private("h1", "/tmp/d.1"));

        // No readers of v1: a plain write supersedes and evicts it
        let (_, evictions) = dip.register_access(&d, Direction::Out).unwrap();
        assert_eq!(evictions, vec![v1]);
    }

    #[test]
    fn reader_done_releases_superseded_version() {
        let mut dip = provider();
        let d = data("d");
        dip.register_access(&d, Direction::Out).unwrap();
        let (read_access, _) = dip.register_access(&d, Direction::In).unwrap();
        let read_inst = read_access.read_instance().unwrap().clone();

        // v2 supersedes v1 while the reader is still live
        let (_, evictions) = dip.register_access(&d, Direction::InOut).unwrap();
        assert!(evictions.is_empty());

        // The RW read hold and the plain read hold both release v1
        let evictions = dip.reader_done(&read_inst);
        assert!(evictions.is_empty(), "RW read hold still live");
        let evictions = dip.reader_done(&read_inst);
        assert_eq!(evictions, vec![read_inst]);
    }

    #[test]
    fn delete_with_readers_defers() {
        let mut dip = provider();
        let d = data("d");
        dip.register_access(&d, Direction::Out).unwrap();
        let (access, _) = dip.register_access(&d, Direction::In).unwrap();
        let inst = access.read_instance().unwrap().clone();

        assert_eq!(dip.delete(&d).unwrap(), DeleteOutcome::Deferred);
        assert!(dip.is_known(&d));

        // Last reader releases the deferred delete
        let evictions = dip.reader_done(&inst);
        assert!(!dip.is_known(&d));
        assert!(evictions.contains(&inst));
    }

    #[test]
    fn register_is_one_shot() {
        let mut dip = provider();
        let d = data("d");
        dip.register(d.clone(), None).unwrap();
        assert!(matches!(
            dip.register(d, None),
            Err(DataError::AlreadyRegistered(_))
        ));
    }
}
