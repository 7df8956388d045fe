//! # Task Model
//!
//! Task descriptors as submitted by the bindings: one signature, one or
//! more implementations (each with its own constraints and execution
//! engine), ordered parameters with declared access directions, and the
//! behaviour flags the analyser and scheduler act on.
//!
//! A `TaskDescriptor` is pure input; a `Task` is the runtime's record of
//! one submission, carrying the versioned accesses the DataInfoProvider
//! resolved for it.

use std::time::Duration;

use crate::data::info::{DataAccess, Direction};
use crate::resources::{Constraints, MultiConstraints, ResourceProfile};
use crate::types::{AppId, DataId, GroupName, TaskId};

// ============================================================================
// ENGINES AND IMPLEMENTATIONS
// ============================================================================

/// How one implementation of a task signature actually runs
#[derive(Debug, Clone, PartialEq)]
pub enum Engine {
    /// In-language method dispatched by a worker
    Method { class: String, method: String },
    /// Plain executable
    Binary { path: String },
    /// MPI executable laid out over processes-per-node
    Mpi {
        binary: String,
        processes_per_node: u32,
    },
    /// Containerized command
    Container { image: String, command: String },
    /// Remote service operation
    Service { endpoint: String, operation: String },
}

/// One implementation: an engine plus the constraints it needs
#[derive(Debug, Clone)]
pub struct Implementation {
    pub engine: Engine,
    pub constraints: Constraints,
}

impl Implementation {
    pub fn method(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            engine: Engine::Method {
                class: class.into(),
                method: method.into(),
            },
            constraints: Constraints::one_core(),
        }
    }

    pub fn binary(path: impl Into<String>) -> Self {
        Self {
            engine: Engine::Binary { path: path.into() },
            constraints: Constraints::one_core(),
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// The constraints to match against, with MPI layouts scaled up
    pub fn effective_constraints(&self) -> Constraints {
        match &self.engine {
            Engine::Mpi {
                processes_per_node, ..
            } => self.constraints.scale_up_by(*processes_per_node),
            _ => self.constraints.clone(),
        }
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// Standard stream a parameter may bind to on the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamBinding {
    Stdin,
    Stdout,
    Stderr,
    #[default]
    Unspec,
}

/// One declared parameter of a task
#[derive(Debug, Clone)]
pub struct Parameter {
    pub data: DataId,
    pub direction: Direction,
    pub stream: StreamBinding,
    /// Literal prefix prepended on the invoker command line
    pub prefix: String,
    /// Formal parameter name
    pub name: String,
}

impl Parameter {
    pub fn new(data: DataId, direction: Direction) -> Self {
        Self {
            data,
            direction,
            stream: StreamBinding::Unspec,
            prefix: String::new(),
            name: String::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stream(mut self, stream: StreamBinding) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

// ============================================================================
// FLAGS
// ============================================================================

/// What to do when execution fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFailure {
    /// Retry on another (or the same) resource, up to the retry budget
    #[default]
    Retry,
    /// Mark every transitive successor failed without running it
    CancelSuccessors,
    /// Propagate an application-level failure
    Fail,
    /// Treat as success for dependency purposes
    Ignore,
}

/// Behaviour flags of one task
#[derive(Debug, Clone)]
pub struct TaskFlags {
    /// Run once on every matching resource
    pub is_replicated: bool,
    /// Sibling tasks of the group must land on distinct resources
    pub is_distributed: bool,
    /// Materialize as a binary reduction tree
    pub is_reduce: bool,
    /// Leaf width of the reduction tree
    pub reduce_chunk_size: usize,
    /// The callee object itself is a parameter
    pub has_target: bool,
    /// Jumps the ready queue
    pub prioritary: bool,
    /// Non-zero exit values are failures
    pub fail_by_exit_value: bool,
    pub on_failure: OnFailure,
    /// Converts over-time into the configured failure, counted from dispatch
    pub timeout: Option<Duration>,
    /// Retry budget under `OnFailure::Retry`
    pub max_retries: u32,
}

impl Default for TaskFlags {
    fn default() -> Self {
        Self {
            is_replicated: false,
            is_distributed: false,
            is_reduce: false,
            reduce_chunk_size: 2,
            has_target: false,
            prioritary: false,
            fail_by_exit_value: true,
            on_failure: OnFailure::default(),
            timeout: None,
            max_retries: 2,
        }
    }
}

// ============================================================================
// DESCRIPTOR
// ============================================================================

/// A task as the bindings submit it
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    /// User-facing signature, e.g. `matmul.multiply(IN,IN,OUT)`
    pub signature: String,
    pub implementations: Vec<Implementation>,
    pub parameters: Vec<Parameter>,
    pub num_returns: usize,
    pub flags: TaskFlags,
    /// Task group for group barriers, if any
    pub group: Option<GroupName>,
}

impl TaskDescriptor {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            implementations: Vec::new(),
            parameters: Vec::new(),
            num_returns: 0,
            flags: TaskFlags::default(),
            group: None,
        }
    }

    pub fn with_implementation(mut self, implementation: Implementation) -> Self {
        self.implementations.push(implementation);
        self
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_group(mut self, group: GroupName) -> Self {
        self.group = Some(group);
        self
    }

    pub fn prioritary(mut self) -> Self {
        self.flags.prioritary = true;
        self
    }
}

// ============================================================================
// TASK
// ============================================================================

/// The runtime record of one submitted task
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub app: AppId,
    pub descriptor: TaskDescriptor,
    /// Versioned accesses, parallel to `descriptor.parameters`
    pub accesses: Vec<DataAccess>,
    /// Global submission order; the FIFO/LIFO score input
    pub submission_index: u64,
    /// Retries consumed so far
    pub retries_used: u32,
}

impl Task {
    pub fn new(
        id: TaskId,
        app: AppId,
        descriptor: TaskDescriptor,
        accesses: Vec<DataAccess>,
        submission_index: u64,
    ) -> Self {
        Self {
            id,
            app,
            descriptor,
            accesses,
            submission_index,
            retries_used: 0,
        }
    }

    /// Instances this task reads (transfer inputs)
    pub fn input_instances(&self) -> Vec<crate::types::DataInstanceId> {
        self.accesses
            .iter()
            .filter_map(|a| a.read_instance().cloned())
            .collect()
    }

    /// Instances this task writes (registered on completion)
    pub fn output_instances(&self) -> Vec<crate::types::DataInstanceId> {
        self.accesses
            .iter()
            .filter_map(|a| a.written_instance().cloned())
            .collect()
    }

    /// The per-implementation constraint sets of this task
    pub fn multi_constraints(&self) -> MultiConstraints {
        MultiConstraints {
            variants: self
                .descriptor
                .implementations
                .iter()
                .map(|imp| imp.effective_constraints())
                .collect(),
        }
    }

    /// Cheapest implementation this profile can host, if any
    pub fn best_implementation(&self, profile: &ResourceProfile) -> Option<usize> {
        self.multi_constraints().best_match(profile)
    }

    pub fn on_failure(&self) -> OnFailure {
        self.descriptor.flags.on_failure
    }

    pub fn can_retry(&self) -> bool {
        self.retries_used < self.descriptor.flags.max_retries
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessorEntry, ProcessorKind};
    use crate::types::Version;
    use crate::types::DataInstanceId;

    fn profile(cores: u32) -> ResourceProfile {
        ResourceProfile {
            processors: vec![ProcessorEntry {
                name: "main".into(),
                architecture: "x86_64".into(),
                speed_ghz: 2.0,
                cores,
                kind: ProcessorKind::Cpu,
            }],
            total_cores: cores,
            memory_gb: 32.0,
            storage_gb: 100.0,
            ..ResourceProfile::default()
        }
    }

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor::new("demo.run(IN,OUT)")
            .with_implementation(
                Implementation::method("Demo", "run")
                    .with_constraints(Constraints::one_core().with_cores(2)),
            )
            .with_parameter(Parameter::new(DataId::new("in").unwrap(), Direction::In))
            .with_parameter(Parameter::new(DataId::new("out").unwrap(), Direction::Out))
    }

    fn task(accesses: Vec<DataAccess>) -> Task {
        Task::new(TaskId::new(1), AppId::new(1), descriptor(), accesses, 0)
    }

    #[test]
    fn input_and_output_instances_follow_accesses() {
        let read = DataInstanceId::new(DataId::new("in").unwrap(), Version::FIRST);
        let written = DataInstanceId::new(DataId::new("out").unwrap(), Version::FIRST);
        let t = task(vec![
            DataAccess::Read {
                instance: read.clone(),
            },
            DataAccess::Write {
                instance: written.clone(),
            },
        ]);

        assert_eq!(t.input_instances(), vec![read]);
        assert_eq!(t.output_instances(), vec![written]);
    }

    #[test]
    fn best_implementation_prefers_cheapest_fit() {
        let mut desc = TaskDescriptor::new("multi")
            .with_implementation(
                Implementation::binary("/opt/fat")
                    .with_constraints(Constraints::one_core().with_cores(8)),
            )
            .with_implementation(
                Implementation::binary("/opt/slim")
                    .with_constraints(Constraints::one_core().with_cores(1)),
            );
        desc.num_returns = 0;
        let t = Task::new(TaskId::new(1), AppId::new(1), desc, vec![], 0);

        assert_eq!(t.best_implementation(&profile(4)), Some(1));
        assert_eq!(t.best_implementation(&profile(16)), Some(1));
    }

    #[test]
    fn mpi_constraints_scale_before_matching() {
        let imp = Implementation {
            engine: Engine::Mpi {
                binary: "/opt/solver".into(),
                processes_per_node: 4,
            },
            constraints: Constraints::one_core().with_cores(2),
        };
        assert_eq!(imp.effective_constraints().processor_core_count, 8);

        let desc = TaskDescriptor::new("mpi").with_implementation(imp);
        let t = Task::new(TaskId::new(1), AppId::new(1), desc, vec![], 0);
        assert_eq!(t.best_implementation(&profile(4)), None);
        assert_eq!(t.best_implementation(&profile(8)), Some(0));
    }

    #[test]
    fn retry_budget() {
        let mut t = task(vec![]);
        assert!(t.can_retry());
        t.retries_used = 2;
        assert!(!t.can_retry());
    }
}
