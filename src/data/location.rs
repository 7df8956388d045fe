//! Physical data locations
//!
//! A location is one of: a private path on a specific host, a path
//! relative to a shared disk (resolvable on any mounting host), or a
//! persistent object id. Locations render to URIs for the bindings:
//!
//! - `file://host/abs/path`
//! - `shared://disk/rel/path`
//! - `object://id`

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use super::shared_disk::SharedDiskRegistry;

/// One physical replica of a data instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataLocation {
    /// Absolute path on one host; invisible to every other host
    Private { host: String, path: PathBuf },
    /// Path relative to a shared disk's mount point
    Shared { disk: String, path: PathBuf },
    /// Object held by an external persistent store
    Persistent { object_id: String },
}

/// Location parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("Invalid location URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Unsupported location scheme: '{0}'")]
    UnsupportedScheme(String),

    #[error("Private location path is not absolute: '{0}'")]
    NotAbsolute(String),

    #[error("Private location URI has no host")]
    MissingHost,

    #[error("Shared location URI has no disk name")]
    MissingDisk,
}

impl DataLocation {
    pub fn private(host: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Private {
            host: host.into(),
            path: path.into(),
        }
    }

    pub fn shared(disk: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Shared {
            disk: disk.into(),
            path: path.into(),
        }
    }

    pub fn persistent(object_id: impl Into<String>) -> Self {
        Self::Persistent {
            object_id: object_id.into(),
        }
    }

    /// Parse a location URI
    pub fn parse(uri: &str) -> Result<Self, LocationError> {
        let parsed = Url::parse(uri).map_err(|e| LocationError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;

        match parsed.scheme() {
            "file" => {
                let host = parsed
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or(LocationError::MissingHost)?;
                let path = parsed.path();
                if !path.starts_with('/') || path == "/" {
                    return Err(LocationError::NotAbsolute(path.to_string()));
                }
                Ok(Self::private(host, path))
            }
            "shared" => {
                let disk = parsed
                    .host_str()
                    .filter(|d| !d.is_empty())
                    .ok_or(LocationError::MissingDisk)?;
                let rel = parsed.path().trim_start_matches('/');
                if rel.is_empty() {
                    return Err(LocationError::InvalidUri {
                        uri: uri.to_string(),
                        reason: "shared location needs a relative path".into(),
                    });
                }
                Ok(Self::shared(disk, rel))
            }
            "object" => {
                let id = parsed.host_str().unwrap_or_default().to_string()
                    + parsed.path().trim_end_matches('/');
                if id.is_empty() {
                    return Err(LocationError::InvalidUri {
                        uri: uri.to_string(),
                        reason: "object location needs an id".into(),
                    });
                }
                Ok(Self::persistent(id))
            }
            other => Err(LocationError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Render back to the canonical URI form
    pub fn to_uri(&self) -> String {
        match self {
            Self::Private { host, path } => format!("file://{}{}", host, path.display()),
            Self::Shared { disk, path } => format!("shared://{}/{}", disk, path.display()),
            Self::Persistent { object_id } => format!("object://{}", object_id),
        }
    }

    /// Hosts that can open this replica without any copy
    ///
    /// Private: its single host. Shared: every mounter. Persistent: any
    /// host (the object store is reachable fleet-wide).
    pub fn reachable_from(&self, host: &str, disks: &SharedDiskRegistry) -> bool {
        match self {
            Self::Private { host: mine, .. } => mine == host,
            Self::Shared { disk, .. } => disks.mount_point(disk, host).is_some(),
            Self::Persistent { .. } => true,
        }
    }

    /// The absolute path this replica materializes at on `host`, if any
    pub fn physical_path(&self, host: &str, disks: &SharedDiskRegistry) -> Option<PathBuf> {
        match self {
            Self::Private { host: mine, path } => (mine == host).then(|| path.clone()),
            Self::Shared { disk, path } => {
                disks.mount_point(disk, host).map(|mount| mount.join(path))
            }
            Self::Persistent { .. } => None,
        }
    }

    /// Whether this replica already occupies (host, path)
    ///
    /// Shared replicas compare the resolved mount path against the
    /// requested target path, not against their own relative path.
    pub fn matches_target(&self, host: &str, target: &Path, disks: &SharedDiskRegistry) -> bool {
        self.physical_path(host, disks)
            .is_some_and(|p| p == target)
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

// ============================================================================
// TESTS
// ============================================================================
