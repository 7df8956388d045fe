//! # Vela Runtime Core
//!
//! Task-parallel runtime core: dependency tracking, scheduling and data
//! locality for tasks declared with IN/OUT/INOUT parameter accesses.
//!
//! ## Overview
//!
//! An application (through its language bindings) declares tasks and the
//! direction of every parameter access; Vela infers the task graph from
//! those accesses, schedules ready tasks onto a heterogeneous worker
//! fleet, stages data between hosts just in time and enforces completion
//! barriers. The annotation front-end, the production invokers and the
//! SSH connectors are external collaborators behind the seams defined
//! here.
//!
//! ## Architecture
//!
//! Every user-facing mutation is a typed request on one bounded queue:
//!
//! ```text
//! bindings ──> AccessProcessor ──> DataInfoProvider (versioning)
//!                  (1 consumer)      └─> TaskAnalyser (implicit DAG)
//!                                         └─> TaskScheduler (policies)
//!                                              └─> Transfer + Invoker
//! ```
//!
//! The single consumer owns all three components, so none of that state
//! is locked; completions re-enter the queue as `TaskEnd` requests.
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`access`] | Request queue and the consumer driving the triad |
//! | [`analyser`] | Implicit DAG, barriers, failure policies |
//! | [`scheduler`] | Policy-driven dispatch (FIFO, LIFO, locality, load) |
//! | [`data`] | Locations, shared disks, replicas, access versioning |
//! | [`transfer`] | Cheapest-plan staging with request coalescing |
//! | [`fileops`] | Two-priority serial local I/O executor |
//! | [`resources`] | Worker descriptions and constraint matching |
//! | [`invoker`] | Execution seam and the in-tree mock |
//! | [`task`] | Descriptors, implementations, flags |
//! | [`app`] | Application lifecycle and waiters |
//! | [`config`] | Env layer, YAML models, schema validation |
//! | [`runtime`] | Explicit assembly and teardown |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vela::{Runtime, RuntimeConfig, TaskDescriptor};
//! use vela::config::{ProjectConfig, ResourcesConfig};
//!
//! let config = RuntimeConfig::new("/opt/vela", ProjectConfig::default(),
//!     ResourcesConfig::default());
//! let runtime = Runtime::start(config)?;
//!
//! let app = runtime.register_app();
//! let task = runtime.submit(app, TaskDescriptor::new("demo.run(IN,OUT)")).await?;
//! runtime.barrier(app).await?;
//! runtime.end_of_app(app).await?;
//! runtime.shutdown().await;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod access;
pub mod analyser;
pub mod app;
pub mod config;
pub mod data;
pub mod error;
pub mod fileops;
pub mod invoker;
pub mod resources;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod transfer;
pub mod types;

// Re-export the surface the bindings and launchers touch
pub use access::{AccessProcessor, ApError, AppSnapshot};
pub use app::{AppError, AppState};
pub use config::{ProjectConfig, ResourcesConfig, RuntimeConfig, SchedulerSelector};
pub use data::{DataAccess, DataLocation, LogicalStore, SharedDiskRegistry};
pub use data::info::Direction;
pub use error::{format_error_with_suggestion, print_error, FixSuggestion, RuntimeError};
pub use error::{FailureCause, TaskStatus};
pub use invoker::{Invoker, MockInvoker};
pub use resources::{Constraints, MultiConstraints, Worker, WorkerRef};
pub use runtime::{init_tracing, Runtime, MASTER_HOST};
pub use scheduler::{ScheduleError, TaskScheduler};
pub use task::{
    Engine, Implementation, OnFailure, Parameter, StreamBinding, Task, TaskDescriptor, TaskFlags,
};
pub use transfer::{LocalBackend, TransferBackend, TransferError, TransferOrchestrator};
pub use types::{AppId, DataId, DataInstanceId, GroupName, TaskId, Version};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_builder_reads_naturally() {
        let descriptor = TaskDescriptor::new("matmul.multiply(IN,IN,INOUT)")
            .with_implementation(
                Implementation::method("Matmul", "multiply")
                    .with_constraints(Constraints::one_core().with_cores(4)),
            )
            .with_parameter(Parameter::new(DataId::new("a").unwrap(), Direction::In))
            .with_parameter(Parameter::new(DataId::new("b").unwrap(), Direction::In))
            .with_parameter(Parameter::new(DataId::new("c").unwrap(), Direction::InOut));

        assert_eq!(descriptor.parameters.len(), 3);
        assert_eq!(descriptor.implementations.len(), 1);
    }

    #[test]
    fn selector_round_trips_through_config() {
        let selector: SchedulerSelector = "FIFODataLocation".parse().unwrap();
        assert_eq!(selector.to_string(), "FIFODataLocation");
    }
}
