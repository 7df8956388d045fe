//! # Data Manager
//!
//! The data-location subsystem: physical locations, shared-disk topology,
//! the per-instance replica store and the access-versioning provider.
//!
//! - [`location`] - `DataLocation` (private / shared / persistent) and URI parsing
//! - [`shared_disk`] - central disk ↔ host ↔ mount-point topology table
//! - [`logical`] - replica sets and pending transfers per versioned instance
//! - [`info`] - versioning of every access into a `DataAccess`

pub mod info;
pub mod location;
pub mod logical;
pub mod shared_disk;

pub use info::{DataAccess, DataError, DataInfoProvider, DeleteOutcome};
pub use location::{DataLocation, LocationError};
pub use logical::{LogicalData, LogicalStore};
pub use shared_disk::SharedDiskRegistry;
