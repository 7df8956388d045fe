//! # Task Scheduler
//!
//! Receives analyser-ready tasks and matches them to workers under the
//! selected policy. The dispatch decision runs on the AccessProcessor
//! thread; completions and lifecycle events re-enter through requests, so
//! the scheduler itself holds no locks beyond the per-worker capacity
//! state.
//!
//! - [`policy`] - pluggable ranking (FIFO, LIFO, data locality, load balancing)

pub mod policy;

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::resources::{Constraints, WorkerRef};
use crate::task::Task;
use crate::types::{AppId, GroupName, TaskId};
use policy::{rank_workers, SchedulingContext, SchedulingPolicy};

// ============================================================================
// TYPES
// ============================================================================

/// Scheduling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// No declared worker can ever match the task's constraints
    #[error("No resource can ever satisfy the constraints of {0}")]
    ConstraintUnsatisfiable(TaskId),

    /// Every remaining task of the app waits on capacity nobody offers
    #[error("Application {0} is blocked: queued work no current worker can host")]
    Blocked(AppId),

    #[error("Unknown resource: '{0}'")]
    UnknownResource(String),
}

/// One dispatch decision: run `task` on `worker`
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task: Task,
    pub worker: WorkerRef,
    /// Index into the descriptor's implementation set
    pub implementation: usize,
    /// Amounts reserved on the worker; released on the terminal notification
    pub constraints: Constraints,
}

#[derive(Debug)]
struct RunningInstance {
    worker: String,
    constraints: Constraints,
    app: AppId,
}

/// What an application cancel tears down
#[derive(Debug, Default)]
pub struct CancelOutcome {
    /// Ready tasks removed before dispatch
    pub dequeued: Vec<TaskId>,
    /// Running tasks the invoker must signal
    pub running: Vec<TaskId>,
}

/// Whether a terminal instance completed the whole task
#[derive(Debug, PartialEq, Eq)]
pub enum InstanceOutcome {
    /// Every instance of the task is terminal
    TaskDone,
    /// A replicated task still has instances out
    Partial,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Greedy policy-driven dispatcher
pub struct TaskScheduler {
    policy: Box<dyn SchedulingPolicy>,
    workers: HashMap<String, WorkerRef>,
    ctx: SchedulingContext,
    /// Tasks waiting for a worker, dispatch-order decided by the policy
    ready: Vec<Task>,
    running: HashMap<TaskId, Vec<RunningInstance>>,
    /// Workers still owed an instance of a replicated task
    replica_pending: HashMap<TaskId, HashSet<String>>,
    /// Workers already used per distributed group
    distributed_used: HashMap<(AppId, GroupName), HashSet<String>>,
}

impl TaskScheduler {
    pub fn new(policy: Box<dyn SchedulingPolicy>, ctx: SchedulingContext) -> Self {
        Self {
            policy,
            workers: HashMap::new(),
            ctx,
            ready: Vec::new(),
            running: HashMap::new(),
            replica_pending: HashMap::new(),
            distributed_used: HashMap::new(),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle events
    // ------------------------------------------------------------------

    /// A worker joined; queued work is re-attempted
    #[instrument(skip(self, worker), fields(worker = %worker.name))]
    pub fn worker_added(&mut self, worker: WorkerRef) -> Vec<Dispatch> {
        self.ctx.worker_order.push(worker.name.clone());
        // Queued replicated tasks owe the newcomer an instance too
        for task in &self.ready {
            if task.descriptor.flags.is_replicated
                && task.best_implementation(&worker.profile).is_some()
            {
                self.replica_pending
                    .entry(task.id)
                    .or_default()
                    .insert(worker.name.clone());
            }
        }
        self.workers.insert(worker.name.clone(), worker);
        self.try_dispatch()
    }

    /// A worker left; returns tasks orphaned mid-run for re-planning
    #[instrument(skip(self))]
    pub fn worker_removed(&mut self, name: &str) -> Vec<TaskId> {
        self.workers.remove(name);
        self.ctx.worker_order.retain(|n| n != name);
        for pending in self.replica_pending.values_mut() {
            pending.remove(name);
        }

        let mut orphaned = Vec::new();
        for (task_id, instances) in self.running.iter_mut() {
            let before = instances.len();
            instances.retain(|i| i.worker != name);
            if instances.len() < before {
                orphaned.push(*task_id);
            }
        }
        self.running.retain(|_, instances| !instances.is_empty());
        if !orphaned.is_empty() {
            warn!(worker = name, orphaned = orphaned.len(), "Worker left with tasks running");
        }
        orphaned
    }

    // ------------------------------------------------------------------
    // Ready tasks and dispatch
    // ------------------------------------------------------------------

    /// Err when no current worker could ever host the task
    ///
    /// An empty fleet passes: workers may still arrive. The task is not
    /// failed either way; it parks until the fleet changes.
    pub fn check_task(&self, task: &Task) -> Result<(), ScheduleError> {
        if self.workers.is_empty()
            || self
                .workers
                .values()
                .any(|w| task.best_implementation(&w.profile).is_some())
        {
            Ok(())
        } else {
            Err(ScheduleError::ConstraintUnsatisfiable(task.id))
        }
    }

    /// Queue a ready task and greedily dispatch whatever fits
    pub fn task_ready(&mut self, task: Task) -> Vec<Dispatch> {
        if let Err(e) = self.check_task(&task) {
            warn!(
                error = %e,
                task = %task.id,
                "Task parked; it can only run if the fleet changes"
            );
        }
        if task.descriptor.flags.is_replicated {
            // One instance per capable worker, tracked until all complete;
            // with no capable worker yet the task just parks
            let owed: HashSet<String> = self
                .workers
                .values()
                .filter(|w| task.best_implementation(&w.profile).is_some())
                .map(|w| w.name.clone())
                .collect();
            if !owed.is_empty() {
                self.replica_pending.insert(task.id, owed);
            }
        }
        self.ready.push(task);
        self.try_dispatch()
    }

    /// One greedy pass over the ready queue
    fn try_dispatch(&mut self) -> Vec<Dispatch> {
        let mut order: Vec<usize> = (0..self.ready.len()).collect();
        order.sort_by(|&a, &b| {
            let (ta, tb) = (&self.ready[a], &self.ready[b]);
            tb.descriptor
                .flags
                .prioritary
                .cmp(&ta.descriptor.flags.prioritary)
                .then_with(|| self.policy.task_order(ta, tb))
        });

        let mut dispatches = Vec::new();
        let mut dispatched_indices = Vec::new();

        for idx in order {
            let task = self.ready[idx].clone();
            if task.descriptor.flags.is_replicated {
                let new = self.dispatch_replicated(task.clone());
                dispatches.extend(new);
                // A replicated task leaves the queue once every owed
                // instance is out the door
                let fully_covered = self
                    .replica_pending
                    .get(&task.id)
                    .is_some_and(|owed| owed.is_empty());
                if fully_covered {
                    dispatched_indices.push(idx);
                }
            } else if let Some(dispatch) = self.dispatch_single(&task) {
                dispatched_indices.push(idx);
                dispatches.push(dispatch);
            }
        }

        // Remove dispatched tasks, highest index first
        dispatched_indices.sort_unstable_by(|a, b| b.cmp(a));
        for idx in dispatched_indices {
            self.ready.swap_remove(idx);
        }

        dispatches
    }

    /// Pick the best worker with free capacity for one ordinary task
    fn dispatch_single(&self, task: &Task) -> Option<Dispatch> {
        let excluded = task
            .descriptor
            .group
            .as_ref()
            .filter(|_| task.descriptor.flags.is_distributed)
            .and_then(|g| self.distributed_used.get(&(task.app, g.clone())));

        let candidates: Vec<WorkerRef> = self
            .workers
            .values()
            .filter(|w| task.best_implementation(&w.profile).is_some())
            .filter(|w| excluded.is_none_or(|used| !used.contains(&w.name)))
            .cloned()
            .collect();

        for worker in rank_workers(self.policy.as_ref(), task, candidates, &self.ctx) {
            let implementation = task
                .best_implementation(&worker.profile)
                .expect("candidate filtered as capable");
            let constraints =
                task.descriptor.implementations[implementation].effective_constraints();
            if worker.try_reserve(&constraints) {
                trace!(task = %task.id, worker = %worker.name, "Dispatch");
                return Some(Dispatch {
                    task: task.clone(),
                    worker,
                    implementation,
                    constraints,
                });
            }
        }
        None
    }

    /// Dispatch owed instances of a replicated task wherever capacity allows
    fn dispatch_replicated(&mut self, task: Task) -> Vec<Dispatch> {
        let Some(owed) = self.replica_pending.get(&task.id) else {
            return Vec::new();
        };

        let mut dispatches = Vec::new();
        let mut covered = Vec::new();
        for name in owed {
            let Some(worker) = self.workers.get(name) else {
                continue;
            };
            let Some(implementation) = task.best_implementation(&worker.profile) else {
                continue;
            };
            let constraints =
                task.descriptor.implementations[implementation].effective_constraints();
            if worker.try_reserve(&constraints) {
                covered.push(name.clone());
                dispatches.push(Dispatch {
                    task: task.clone(),
                    worker: worker.clone(),
                    implementation,
                    constraints,
                });
            }
        }

        if let Some(owed) = self.replica_pending.get_mut(&task.id) {
            for name in covered {
                owed.remove(&name);
            }
        }
        dispatches
    }

    fn replica_owed(&self, task: TaskId) -> usize {
        self.replica_pending
            .get(&task)
            .map(|owed| owed.len())
            .unwrap_or(0)
    }

    /// Record a dispatch as running (called once the inputs are staged)
    pub fn mark_running(&mut self, dispatch: &Dispatch) {
        if let Some(owed) = self.replica_pending.get_mut(&dispatch.task.id) {
            owed.remove(&dispatch.worker.name);
        }
        if dispatch.task.descriptor.flags.is_distributed {
            if let Some(group) = &dispatch.task.descriptor.group {
                self.distributed_used
                    .entry((dispatch.task.app, group.clone()))
                    .or_default()
                    .insert(dispatch.worker.name.clone());
            }
        }
        self.running
            .entry(dispatch.task.id)
            .or_default()
            .push(RunningInstance {
                worker: dispatch.worker.name.clone(),
                constraints: dispatch.constraints.clone(),
                app: dispatch.task.app,
            });
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    /// Release the capacity one terminal instance held
    ///
    /// Returns `TaskDone` when no instance of the task remains out.
    pub fn instance_finished(&mut self, task_id: TaskId, worker_name: &str) -> InstanceOutcome {
        if let Some(instances) = self.running.get_mut(&task_id) {
            if let Some(pos) = instances.iter().position(|i| i.worker == worker_name) {
                let instance = instances.remove(pos);
                if let Some(worker) = self.workers.get(&instance.worker) {
                    worker.release(&instance.constraints);
                }
            }
            if instances.is_empty() {
                self.running.remove(&task_id);
            }
        }

        let still_out = self.running.contains_key(&task_id) || self.replica_owed(task_id) > 0;
        if still_out {
            InstanceOutcome::Partial
        } else {
            self.replica_pending.remove(&task_id);
            InstanceOutcome::TaskDone
        }
    }

    /// Greedy pass after capacity or fleet changed
    pub fn reschedule(&mut self) -> Vec<Dispatch> {
        self.try_dispatch()
    }

    // ------------------------------------------------------------------
    // Cancellation and queries
    // ------------------------------------------------------------------

    /// Remove an application's queued tasks and list its running ones
    #[instrument(skip(self))]
    pub fn cancel_app(&mut self, app: AppId) -> CancelOutcome {
        let mut outcome = CancelOutcome::default();

        self.ready.retain(|t| {
            if t.app == app {
                outcome.dequeued.push(t.id);
                self.replica_pending.remove(&t.id);
                false
            } else {
                true
            }
        });

        for (&task_id, instances) in &self.running {
            if instances.iter().any(|i| i.app == app) {
                outcome.running.push(task_id);
            }
        }

        self.distributed_used.retain(|(a, _), _| *a != app);
        debug!(
            dequeued = outcome.dequeued.len(),
            running = outcome.running.len(),
            "Application cancelled in scheduler"
        );
        outcome
    }

    /// Tasks queued with no capable worker in the current fleet
    pub fn blocked_tasks(&self) -> Vec<TaskId> {
        if self.workers.is_empty() {
            return Vec::new();
        }
        self.ready
            .iter()
            .filter(|t| !self.satisfiable_strict(t))
            .map(|t| t.id)
            .collect()
    }

    fn satisfiable_strict(&self, task: &Task) -> bool {
        self.workers
            .values()
            .any(|w| task.best_implementation(&w.profile).is_some())
    }

    /// Blocked check for one application
    pub fn check_app(&self, app: AppId) -> Result<(), ScheduleError> {
        let queued: Vec<&Task> = self.ready.iter().filter(|t| t.app == app).collect();
        if queued.is_empty() || self.workers.is_empty() {
            return Ok(());
        }
        let any_running = self
            .running
            .values()
            .any(|instances| instances.iter().any(|i| i.app == app));
        if !any_running && queued.iter().all(|t| !self.satisfiable_strict(t)) {
            return Err(ScheduleError::Blocked(app));
        }
        Ok(())
    }

    pub fn queued_count(&self) -> usize {
        self.ready.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
