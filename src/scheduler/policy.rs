//! Scheduling policies
//!
//! A policy ranks ready tasks and scores (task, worker) pairs; the
//! scheduler stays a dumb greedy loop around whichever policy the
//! operator selected. Policies are constructed through a registry of
//! named constructors resolved at startup, so an unknown selector can
//! never surface mid-run.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{ConfigError, SchedulerSelector};
use crate::data::logical::LogicalStore;
use crate::data::shared_disk::SharedDiskRegistry;
use crate::resources::WorkerRef;
use crate::task::Task;

// ============================================================================
// CONTEXT
// ============================================================================

/// Read-only state a policy may consult while scoring
pub struct SchedulingContext {
    pub store: Arc<LogicalStore>,
    pub disks: Arc<SharedDiskRegistry>,
    /// Worker names in arrival order; the resource-index tie-break
    pub worker_order: Vec<String>,
}

impl SchedulingContext {
    pub fn new(store: Arc<LogicalStore>, disks: Arc<SharedDiskRegistry>) -> Self {
        Self {
            store,
            disks,
            worker_order: Vec::new(),
        }
    }

    pub fn resource_index(&self, name: &str) -> usize {
        self.worker_order
            .iter()
            .position(|n| n == name)
            .unwrap_or(usize::MAX)
    }

    /// Bytes of the task's inputs already resident on the worker's host
    pub fn resident_input_bytes(&self, task: &Task, worker: &WorkerRef) -> u64 {
        task.input_instances()
            .iter()
            .map(|inst| {
                self.store
                    .resident_bytes(inst, &worker.host, &self.disks)
            })
            .sum()
    }

    /// Inputs with at least one replica reachable from the worker's host
    pub fn resident_input_count(&self, task: &Task, worker: &WorkerRef) -> usize {
        task.input_instances()
            .iter()
            .filter(|inst| {
                !self
                    .store
                    .locations_on(inst, &worker.host, &self.disks)
                    .is_empty()
            })
            .count()
    }
}

// ============================================================================
// POLICY TRAIT
// ============================================================================

/// A pluggable scheduling policy
///
/// `task_order` decides which ready task grabs resources first; `score`
/// (higher is better) ranks workers for one task; `tie_break` resolves
/// equal scores.
pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Order ready tasks compete in; default is submission order
    fn task_order(&self, a: &Task, b: &Task) -> Ordering {
        a.submission_index.cmp(&b.submission_index)
    }

    fn score(&self, task: &Task, worker: &WorkerRef, ctx: &SchedulingContext) -> f64;

    fn tie_break(
        &self,
        task: &Task,
        a: &WorkerRef,
        b: &WorkerRef,
        ctx: &SchedulingContext,
    ) -> Ordering;
}

/// Lower resource index wins
fn by_resource_index(a: &WorkerRef, b: &WorkerRef, ctx: &SchedulingContext) -> Ordering {
    ctx.resource_index(&a.name).cmp(&ctx.resource_index(&b.name))
}

// ============================================================================
// POLICIES
// ============================================================================

/// Submission order; workers by arrival index
pub struct FifoPolicy;

impl SchedulingPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "FIFO"
    }

    fn score(&self, _task: &Task, _worker: &WorkerRef, _ctx: &SchedulingContext) -> f64 {
        0.0
    }

    fn tie_break(
        &self,
        _task: &Task,
        a: &WorkerRef,
        b: &WorkerRef,
        ctx: &SchedulingContext,
    ) -> Ordering {
        by_resource_index(a, b, ctx)
    }
}

/// Reverse submission order; workers by arrival index
pub struct LifoPolicy;

impl SchedulingPolicy for LifoPolicy {
    fn name(&self) -> &'static str {
        "LIFO"
    }

    fn task_order(&self, a: &Task, b: &Task) -> Ordering {
        b.submission_index.cmp(&a.submission_index)
    }

    fn score(&self, _task: &Task, _worker: &WorkerRef, _ctx: &SchedulingContext) -> f64 {
        0.0
    }

    fn tie_break(
        &self,
        _task: &Task,
        a: &WorkerRef,
        b: &WorkerRef,
        ctx: &SchedulingContext,
    ) -> Ordering {
        by_resource_index(a, b, ctx)
    }
}

/// Submission order, preferring workers that already hold any input
pub struct FifoDataPolicy;

impl SchedulingPolicy for FifoDataPolicy {
    fn name(&self) -> &'static str {
        "FIFOData"
    }

    fn score(&self, task: &Task, worker: &WorkerRef, ctx: &SchedulingContext) -> f64 {
        ctx.resident_input_count(task, worker) as f64
    }

    fn tie_break(
        &self,
        _task: &Task,
        a: &WorkerRef,
        b: &WorkerRef,
        ctx: &SchedulingContext,
    ) -> Ordering {
        by_resource_index(a, b, ctx)
    }
}

/// Resident input bytes; submission-order task ranking
pub struct DataLocalityPolicy;

impl SchedulingPolicy for DataLocalityPolicy {
    fn name(&self) -> &'static str {
        "FIFODataLocation"
    }

    fn score(&self, task: &Task, worker: &WorkerRef, ctx: &SchedulingContext) -> f64 {
        ctx.resident_input_bytes(task, worker) as f64
    }

    fn tie_break(
        &self,
        _task: &Task,
        a: &WorkerRef,
        b: &WorkerRef,
        ctx: &SchedulingContext,
    ) -> Ordering {
        by_resource_index(a, b, ctx)
    }
}

/// Inverse queue depth; locality breaks ties (the default)
pub struct LoadBalancingPolicy;

impl SchedulingPolicy for LoadBalancingPolicy {
    fn name(&self) -> &'static str {
        "LoadBalancing"
    }

    fn score(&self, _task: &Task, worker: &WorkerRef, _ctx: &SchedulingContext) -> f64 {
        -(worker.load() as f64)
    }

    fn tie_break(
        &self,
        task: &Task,
        a: &WorkerRef,
        b: &WorkerRef,
        ctx: &SchedulingContext,
    ) -> Ordering {
        let locality_a = ctx.resident_input_bytes(task, a);
        let locality_b = ctx.resident_input_bytes(task, b);
        // More resident bytes wins; then arrival index
        locality_b
            .cmp(&locality_a)
            .then_with(|| by_resource_index(a, b, ctx))
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Construct the policy behind a resolved selector
pub fn create_policy(selector: SchedulerSelector) -> Box<dyn SchedulingPolicy> {
    match selector {
        SchedulerSelector::LoadBalancing => Box::new(LoadBalancingPolicy),
        SchedulerSelector::Fifo | SchedulerSelector::Base => Box::new(FifoPolicy),
        SchedulerSelector::Lifo => Box::new(LifoPolicy),
        SchedulerSelector::FifoData => Box::new(FifoDataPolicy),
        SchedulerSelector::FifoDataLocation => Box::new(DataLocalityPolicy),
    }
}

/// Construct a policy by selector name; unknown names are a startup error
pub fn create_policy_by_name(name: &str) -> Result<Box<dyn SchedulingPolicy>, ConfigError> {
    Ok(create_policy(name.parse()?))
}

/// Rank capable workers for a task: best score first, ties broken by the
/// policy, equal candidates by arrival index inside `tie_break`
pub fn rank_workers(
    policy: &dyn SchedulingPolicy,
    task: &Task,
    mut workers: Vec<WorkerRef>,
    ctx: &SchedulingContext,
) -> Vec<WorkerRef> {
    workers.sort_by(|a, b| {
        let score_a = policy.score(task, a, ctx);
        let score_b = policy.score(task, b, ctx);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| policy.tie_break(task, a, b, ctx))
    });
    workers
}

// ============================================================================
// TESTS
// ============================================================================
