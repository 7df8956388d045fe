//! # Runtime Configuration
//!
//! Environment layer and validated in-memory models for the project
//! topology (workers, shared disks, mount points) and the per-host
//! resource descriptions.
//!
//! Parsing front-ends (launchers, XML adapters) live outside the core;
//! what arrives here is YAML text that is deserialized and then checked
//! against an embedded JSON Schema. A schema failure aborts
//! initialization — there is no degraded start.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// ENVIRONMENT VARIABLES
// ============================================================================

/// Install root; required
pub const ENV_HOME: &str = "VELA_HOME";
/// Project topology file path
pub const ENV_PROJECT_FILE: &str = "VELA_PROJECT_FILE";
/// Per-host resources file path
pub const ENV_RESOURCES_FILE: &str = "VELA_RESOURCES_FILE";
/// Scheduler selector name
pub const ENV_SCHEDULER: &str = "VELA_SCHEDULER";
/// Cloud connector name (constructed externally)
pub const ENV_CONNECTOR: &str = "VELA_CONNECTOR";
/// Enables externally-driven resource adaptation
pub const ENV_EXTERNAL_ADAPTATION: &str = "VELA_EXTERNAL_ADAPTATION";

// ============================================================================
// ERRORS
// ============================================================================

/// Startup configuration errors; all of them abort initialization
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{env} is not set", env = ENV_HOME)]
    MissingHome,

    #[error("Configuration schema validation failed: {details}")]
    SchemaFailed { details: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Unknown scheduler selector: '{0}'")]
    UnknownScheduler(String),

    #[error("Configuration IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// SCHEDULER SELECTOR
// ============================================================================

/// The named scheduling policies an operator can select
///
/// Unknown names are a startup error, not a runtime surprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerSelector {
    /// Inverse queue-depth score, data-locality tie-break (default)
    #[default]
    LoadBalancing,
    /// Submission order
    Fifo,
    /// Reverse submission order
    Lifo,
    /// Submission order, preferring resources already holding inputs
    FifoData,
    /// Resident input bytes score, submission-order tie-break
    FifoDataLocation,
    /// Minimal policy: submission order, no locality awareness
    Base,
}

impl FromStr for SchedulerSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LoadBalancing" => Ok(Self::LoadBalancing),
            "FIFO" => Ok(Self::Fifo),
            "LIFO" => Ok(Self::Lifo),
            "FIFOData" => Ok(Self::FifoData),
            "FIFODataLocation" => Ok(Self::FifoDataLocation),
            "Base" => Ok(Self::Base),
            other => Err(ConfigError::UnknownScheduler(other.to_string())),
        }
    }
}

impl fmt::Display for SchedulerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoadBalancing => "LoadBalancing",
            Self::Fifo => "FIFO",
            Self::Lifo => "LIFO",
            Self::FifoData => "FIFOData",
            Self::FifoDataLocation => "FIFODataLocation",
            Self::Base => "Base",
        };
        f.write_str(name)
    }
}

// ============================================================================
// PROJECT TOPOLOGY MODEL
// ============================================================================

/// One worker entry in the project topology
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerEntry {
    /// Unique worker name
    pub name: String,
    /// Host the worker runs on
    pub host: String,
    /// Sandbox directory for materialized instances
    pub working_dir: String,
    /// Shared disks mounted on this host: disk name -> mount point
    #[serde(default)]
    pub mounts: HashMap<String, String>,
    /// Batch queues this worker accepts submissions through
    #[serde(default)]
    pub queues: Vec<String>,
    /// Container images pre-provisioned on this worker
    #[serde(default)]
    pub images: Vec<String>,
}

/// One shared disk declared in the project topology
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SharedDiskEntry {
    pub name: String,
}

/// Project topology: the fleet and the disks it shares
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
    #[serde(default)]
    pub shared_disks: Vec<SharedDiskEntry>,
}

impl ProjectConfig {
    /// Deserialize and schema-check a project topology document
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        validate_schema(&value, &project_schema())?;
        Ok(serde_yaml::from_str(yaml)?)
    }
}

// ============================================================================
// PER-HOST RESOURCES MODEL
// ============================================================================

/// Processor kind, as declared per host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    #[default]
    Cpu,
    Gpu,
    Fpga,
}

/// One processor of a host
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorEntry {
    pub name: String,
    pub architecture: String,
    #[serde(default)]
    pub speed_ghz: f64,
    pub cores: u32,
    #[serde(default)]
    pub kind: ProcessorKind,
}

/// Hardware and software description of one host
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostEntry {
    pub host: String,
    pub processors: Vec<ProcessorEntry>,
    #[serde(default)]
    pub memory_gb: f64,
    #[serde(default)]
    pub storage_gb: f64,
    #[serde(default)]
    pub operating_system: Option<String>,
    #[serde(default)]
    pub software: Vec<String>,
}

/// Per-host resource descriptions
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

impl ResourcesConfig {
    /// Deserialize and schema-check a resources document
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        validate_schema(&value, &resources_schema())?;
        Ok(serde_yaml::from_str(yaml)?)
    }
}

// ============================================================================
// SCHEMA VALIDATION
// ============================================================================

/// Validate a configuration document against an embedded JSON Schema
fn validate_schema(value: &Value, schema: &Value) -> Result<(), ConfigError> {
    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| ConfigError::SchemaFailed {
        details: format!("Invalid embedded schema: {}", e),
    })?;

    let result: Result<(), String> = match compiled.validate(value) {
        Ok(()) => Ok(()),
        Err(errors) => {
            let error_msgs: Vec<String> = errors.map(|e| e.to_string()).collect();
            Err(error_msgs.join("; "))
        }
    };
    result.map_err(|details| ConfigError::SchemaFailed { details })
}

fn project_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "workers": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "host", "working_dir"],
                    "properties": {
                        "name": {"type": "string", "minLength": 1},
                        "host": {"type": "string", "minLength": 1},
                        "working_dir": {"type": "string", "minLength": 1},
                        "mounts": {
                            "type": "object",
                            "additionalProperties": {"type": "string", "minLength": 1}
                        },
                        "queues": {"type": "array", "items": {"type": "string"}},
                        "images": {"type": "array", "items": {"type": "string"}}
                    }
                }
            },
            "shared_disks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {"name": {"type": "string", "minLength": 1}}
                }
            }
        }
    })
}

fn resources_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "hosts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["host", "processors"],
                    "properties": {
                        "host": {"type": "string", "minLength": 1},
                        "processors": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "required": ["name", "architecture", "cores"],
                                "properties": {
                                    "name": {"type": "string"},
                                    "architecture": {"type": "string"},
                                    "speed_ghz": {"type": "number", "minimum": 0},
                                    "cores": {"type": "integer", "minimum": 1},
                                    "kind": {"enum": ["cpu", "gpu", "fpga"]}
                                }
                            }
                        },
                        "memory_gb": {"type": "number", "minimum": 0},
                        "storage_gb": {"type": "number", "minimum": 0},
                        "operating_system": {"type": ["string", "null"]},
                        "software": {"type": "array", "items": {"type": "string"}}
                    }
                }
            }
        }
    })
}

// ============================================================================
// RUNTIME CONFIG
// ============================================================================

/// Everything the runtime needs to start, resolved once at boot
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Install root (required)
    pub home: PathBuf,
    /// Selected scheduling policy
    pub scheduler: SchedulerSelector,
    /// Named cloud connector, constructed by an external collaborator
    pub connector: Option<String>,
    /// Whether resource adaptation is driven externally
    pub external_adaptation: bool,
    /// Fleet topology
    pub project: ProjectConfig,
    /// Per-host hardware
    pub resources: ResourcesConfig,
}

impl RuntimeConfig {
    /// Build a config from explicit parts (tests, embedded launchers)
    pub fn new(home: impl Into<PathBuf>, project: ProjectConfig, resources: ResourcesConfig) -> Self {
        Self {
            home: home.into(),
            scheduler: SchedulerSelector::default(),
            connector: None,
            external_adaptation: false,
            project,
            resources,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerSelector) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Resolve the configuration from the environment
    ///
    /// Recognized variables: VELA_HOME (required), VELA_PROJECT_FILE,
    /// VELA_RESOURCES_FILE, VELA_SCHEDULER, VELA_CONNECTOR,
    /// VELA_EXTERNAL_ADAPTATION. Anything else is ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = env::var(ENV_HOME).map_err(|_| ConfigError::MissingHome)?;

        let scheduler = match env::var(ENV_SCHEDULER) {
            Ok(name) => name.parse()?,
            Err(_) => SchedulerSelector::default(),
        };

        let project = match env::var(ENV_PROJECT_FILE) {
            Ok(path) => ProjectConfig::from_yaml(&std::fs::read_to_string(path)?)?,
            Err(_) => ProjectConfig::default(),
        };

        let resources = match env::var(ENV_RESOURCES_FILE) {
            Ok(path) => ResourcesConfig::from_yaml(&std::fs::read_to_string(path)?)?,
            Err(_) => ResourcesConfig::default(),
        };

        let connector = env::var(ENV_CONNECTOR).ok();
        let external_adaptation = env::var(ENV_EXTERNAL_ADAPTATION)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        debug!(
            scheduler = %scheduler,
            workers = project.workers.len(),
            hosts = resources.hosts.len(),
            "Resolved runtime configuration"
        );

        Ok(Self {
            home: PathBuf::from(home),
            scheduler,
            connector,
            external_adaptation,
            project,
            resources,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
