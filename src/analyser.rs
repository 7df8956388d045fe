//! # Task Analyser
//!
//! Consumes versioned accesses and builds the implicit task graph: a task
//! depends on the last writer of every instance it reads, so the DAG is
//! acyclic by construction (edges only point backwards in submission
//! order). Tracks per-application outstanding work for barriers and the
//! two-phase end-of-app, and resolves failure policies on completion.
//!
//! Runs entirely on the AccessProcessor thread; no state here is locked.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, instrument, trace, warn};

use crate::app::{AppError, AppRegistry, Released};
use crate::data::info::DataInfoProvider;
use crate::error::{FailureCause, TaskStatus};
use crate::task::{OnFailure, Task};
use crate::types::{DataInstanceId, TaskId};

// ============================================================================
// OUTCOMES
// ============================================================================

/// Everything one terminal notification unblocks
#[derive(Debug, Default)]
pub struct EndOutcome {
    /// Tasks whose predecessor count reached zero
    pub newly_ready: Vec<Task>,
    /// The same task, rescheduled under a Retry policy
    pub retry: Option<Task>,
    /// Transitive successors failed without running (CancelSuccessors)
    pub cancelled_successors: Vec<TaskId>,
    /// Application waiters this completion freed
    pub released: Released,
    /// Instances whose last hold vanished; physical cleanup is due
    pub evictions: Vec<DataInstanceId>,
}

impl EndOutcome {
    fn merge_released(&mut self, mut other: Released) {
        self.released.ok.append(&mut other.ok);
        self.released.end_ok.append(&mut other.end_ok);
        self.released.app_drained |= other.app_drained;
        if self.released.error.is_none() {
            self.released.error = other.error;
        }
    }
}

// ============================================================================
// ANALYSER
// ============================================================================

/// Builds and releases the implicit dependency graph
#[derive(Debug, Default)]
pub struct TaskAnalyser {
    /// Live (non-terminal) tasks
    tasks: HashMap<TaskId, Task>,
    successors: HashMap<TaskId, Vec<TaskId>>,
    pred_count: HashMap<TaskId, usize>,
    /// Writer of each instance, while that writer is still live
    last_writer: HashMap<DataInstanceId, TaskId>,
    /// Per-application counters and waiters
    pub apps: AppRegistry,
}

impl TaskAnalyser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task's accesses into the graph
    ///
    /// Returns the task back when it has no pending predecessors and can
    /// go straight to the scheduler.
    #[instrument(skip(self, task), fields(task = %task.id, app = %task.app))]
    pub fn register_task(&mut self, task: Task) -> Result<Option<Task>, AppError> {
        self.apps
            .task_submitted(task.app, task.id, task.descriptor.group.as_ref())?;

        let mut preds: HashSet<TaskId> = HashSet::new();
        for access in &task.accesses {
            if let Some(read) = access.read_instance() {
                if let Some(&writer) = self.last_writer.get(read) {
                    if self.tasks.contains_key(&writer) {
                        preds.insert(writer);
                    }
                }
            }
            if let Some(written) = access.written_instance() {
                self.last_writer.insert(written.clone(), task.id);
            }
        }

        for &pred in &preds {
            self.successors.entry(pred).or_default().push(task.id);
        }
        self.pred_count.insert(task.id, preds.len());
        trace!(predecessors = preds.len(), "Task analysed");

        let ready = preds.is_empty();
        let id = task.id;
        self.tasks.insert(id, task);

        if ready {
            Ok(Some(self.tasks[&id].clone()))
        } else {
            Ok(None)
        }
    }

    /// Direct predecessors still blocking a task (test and debug hook)
    pub fn pending_predecessors(&self, task: TaskId) -> usize {
        self.pred_count.get(&task).copied().unwrap_or(0)
    }

    pub fn is_live(&self, task: TaskId) -> bool {
        self.tasks.contains_key(&task)
    }

    /// Resolve one terminal notification
    ///
    /// Applies the task's failure policy, releases read holds, decrements
    /// successor counts and frees application waiters.
    #[instrument(skip(self, dip), fields(task = %task_id))]
    pub fn task_ended(
        &mut self,
        task_id: TaskId,
        status: TaskStatus,
        dip: &mut DataInfoProvider,
    ) -> EndOutcome {
        let mut outcome = EndOutcome::default();
        let Some(task) = self.tasks.get(&task_id) else {
            // Duplicate or post-cancel notification
            return outcome;
        };

        let failed = matches!(status, TaskStatus::Failed(_));
        let effective = if failed && task.on_failure() == OnFailure::Ignore {
            TaskStatus::Finished
        } else {
            status
        };

        if let TaskStatus::Failed(cause) = &effective {
            let task = self.tasks.get_mut(&task_id).expect("live task");
            match task.on_failure() {
                OnFailure::Retry if task.can_retry() => {
                    task.retries_used += 1;
                    debug!(
                        retry = task.retries_used,
                        cause = ?cause,
                        "Task failed, rescheduling"
                    );
                    outcome.retry = Some(task.clone());
                    return outcome;
                }
                OnFailure::CancelSuccessors => {
                    warn!(cause = ?cause, "Task failed; cancelling transitive successors");
                    let cancelled = self.collect_successor_cone(task_id);
                    self.finish_one(task_id, dip, &mut outcome);
                    for succ in cancelled {
                        outcome.cancelled_successors.push(succ);
                        self.finish_one(succ, dip, &mut outcome);
                    }
                    // Nothing cancelled may surface as ready
                    outcome.newly_ready.retain(|t| self.tasks.contains_key(&t.id));
                    return outcome;
                }
                OnFailure::Fail => {
                    let app = task.app;
                    warn!(cause = ?cause, "Task failed; the application surfaces the failure");
                    self.apps.task_failed(app);
                }
                _ => {
                    warn!(cause = ?cause, "Task failed");
                }
            }
        }

        self.finish_one(task_id, dip, &mut outcome);
        outcome
    }

    /// Make one task terminal: release holds, free successors, account app
    fn finish_one(&mut self, task_id: TaskId, dip: &mut DataInfoProvider, outcome: &mut EndOutcome) {
        let Some(task) = self.tasks.remove(&task_id) else {
            return;
        };
        self.pred_count.remove(&task_id);

        for read in task.input_instances() {
            outcome.evictions.append(&mut dip.reader_done(&read));
        }

        // Writers of these instances are gone; later readers need no edge
        for written in task.output_instances() {
            if self.last_writer.get(&written) == Some(&task_id) {
                self.last_writer.remove(&written);
            }
        }

        if let Some(succs) = self.successors.remove(&task_id) {
            for succ in succs {
                if let Some(count) = self.pred_count.get_mut(&succ) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        if let Some(t) = self.tasks.get(&succ) {
                            outcome.newly_ready.push(t.clone());
                        }
                    }
                }
            }
        }

        let released = self
            .apps
            .task_finished(task.app, task.descriptor.group.as_ref());
        outcome.merge_released(released);
    }

    /// Transitive successor cone of a task, in BFS order
    fn collect_successor_cone(&self, root: TaskId) -> Vec<TaskId> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        let mut cone = Vec::new();

        queue.push_back(root);
        seen.insert(root);

        while let Some(current) = queue.pop_front() {
            if let Some(succs) = self.successors.get(&current) {
                for &succ in succs {
                    if seen.insert(succ) && self.tasks.contains_key(&succ) {
                        cone.push(succ);
                        queue.push_back(succ);
                    }
                }
            }
        }

        cone
    }

    /// Tasks of one application still live (cancel support)
    pub fn live_tasks_of(&self, app: crate::types::AppId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.app == app)
            .map(|t| t.id)
            .collect()
    }

    /// Forcibly retire a task without policy resolution (app cancel)
    pub fn drop_task(&mut self, task_id: TaskId, dip: &mut DataInfoProvider) -> EndOutcome {
        let mut outcome = EndOutcome::default();
        self.finish_one(task_id, dip, &mut outcome);
        outcome
    }
}

// ============================================================================
// TESTS
// ============================================================================
