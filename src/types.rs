//! NewType wrappers for runtime identities
//!
//! Zero-cost wrappers for the ids that flow through the whole runtime,
//! preventing type confusion between logical data, versioned instances,
//! tasks and applications.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

// ============================================================================
// DATA ID
// ============================================================================

/// Charset for logical data identities: variable names and file paths
static DATA_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_\-./~]*$").expect("valid regex"));

/// Strongly-typed logical data identity (a user variable or a file path)
///
/// Guarantees:
/// - Non-empty
/// - Valid characters (alphanumeric, dash, underscore, dot, slash, tilde)
/// - Maximum 255 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(Arc<str>);

impl DataId {
    /// Maximum allowed length
    pub const MAX_LENGTH: usize = 255;

    /// Create a new DataId with validation
    pub fn new(id: impl AsRef<str>) -> Result<Self, DataIdError> {
        let id = id.as_ref();

        if id.is_empty() {
            return Err(DataIdError::Empty);
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(DataIdError::TooLong(id.len()));
        }
        if !DATA_ID_RE.is_match(id) {
            return Err(DataIdError::InvalidCharacters(id.to_string()));
        }

        Ok(Self(Arc::from(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DataId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// DataId validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataIdError {
    #[error("Data identity cannot be empty")]
    Empty,

    #[error("Data identity too long: {0} chars (max {max})", max = DataId::MAX_LENGTH)]
    TooLong(usize),

    #[error("Data identity contains invalid characters: '{0}'")]
    InvalidCharacters(String),
}

// ============================================================================
// VERSION / DATA INSTANCE
// ============================================================================

/// Monotonic version of a logical datum; advances only on a write access
///
/// The default (zero) value means "never written".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(u32);

impl Version {
    /// Version assigned by the first write
    pub const FIRST: Version = Version(1);

    pub fn new(v: u32) -> Self {
        Self(v)
    }

    /// The version a read-write access writes on top of `self`
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A specific immutable version of a logical datum
///
/// Once written, an instance never changes; later writes to the same
/// DataId produce new instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataInstanceId {
    pub data: DataId,
    pub version: Version,
}

impl DataInstanceId {
    pub fn new(data: DataId, version: Version) -> Self {
        Self { data, version }
    }

    /// Canonical file name for a materialized instance on disk
    pub fn file_name(&self) -> String {
        format!(
            "{}.{}",
            self.data.as_str().replace('/', "_"),
            self.version.get()
        )
    }
}

impl fmt::Display for DataInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.data, self.version)
    }
}

// ============================================================================
// TASK / APPLICATION IDS
// ============================================================================

/// Runtime-allocated task identifier (monotonic per runtime)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Application identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(u64);

impl AppId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app{}", self.0)
    }
}

/// Name of a task group inside one application (used by group barriers)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupName(Arc<str>);

impl GroupName {
    pub fn new(name: impl AsRef<str>) -> Result<Self, GroupNameError> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(GroupNameError::Empty);
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// GroupName validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupNameError {
    #[error("Task group name cannot be empty")]
    Empty,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_id_accepts_variables_and_paths() {
        assert!(DataId::new("matrix_a").is_ok());
        assert!(DataId::new("out-3").is_ok());
        assert!(DataId::new("results/block.0.dat").is_ok());
        assert!(DataId::new("~worker/tmp/x").is_err()); // cannot start with ~
        assert!(DataId::new("data~1").is_ok());
    }

    #[test]
    fn data_id_rejects_empty_and_long() {
        assert_eq!(DataId::new(""), Err(DataIdError::Empty));
        let long = "a".repeat(DataId::MAX_LENGTH + 1);
        assert!(matches!(DataId::new(&long), Err(DataIdError::TooLong(_))));
    }

    #[test]
    fn data_id_rejects_invalid_chars() {
        assert!(matches!(
            DataId::new("has space"),
            Err(DataIdError::InvalidCharacters(_))
        ));
        assert!(matches!(
            DataId::new("semi;colon"),
            Err(DataIdError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn version_advances() {
        assert_eq!(Version::FIRST.get(), 1);
        assert_eq!(Version::FIRST.next().get(), 2);
        assert!(Version::FIRST < Version::FIRST.next());
    }

    #[test]
    fn instance_display_and_file_name() {
        let inst = DataInstanceId::new(DataId::new("results/block.dat").unwrap(), Version::new(3));
        assert_eq!(inst.to_string(), "results/block.dat#v3");
        assert_eq!(inst.file_name(), "results_block.dat.3");
    }

    #[test]
    fn task_and_app_display() {
        assert_eq!(TaskId::new(7).to_string(), "t7");
        assert_eq!(AppId::new(2).to_string(), "app2");
    }
}
