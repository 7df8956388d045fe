//! # Application Registry
//!
//! Per-application lifecycle, outstanding-task counters and the waiters
//! behind barriers and two-phase end-of-app. All state lives on the
//! AccessProcessor thread; completion is signalled through the oneshot
//! reply channels the callers parked on.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::types::{AppId, GroupName, TaskId};

// ============================================================================
// TYPES
// ============================================================================

/// Application lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Known, nothing running yet
    Registered,
    /// Has had at least one task in flight
    Running,
    /// End-of-app requested while tasks remain; resources reclaimable
    Stalled,
    /// Drained after end-of-app or cancel
    Terminated,
}

/// Application lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("Unknown application: {0}")]
    Unknown(AppId),

    #[error("Application {0} was cancelled")]
    Cancelled(AppId),

    #[error("Application {0} no longer accepts submissions")]
    SubmissionClosed(AppId),

    /// A task running under the Fail policy did not complete
    #[error("Application {0} failed: a Fail-policy task did not complete")]
    Failed(AppId),
}

/// A parked caller released with `Ok` or a tagged failure
pub type Waiter = oneshot::Sender<Result<(), AppError>>;

#[derive(Debug, Default)]
struct GroupState {
    outstanding: usize,
    waiters: Vec<Waiter>,
}

#[derive(Debug)]
struct Application {
    state: AppState,
    outstanding: usize,
    tasks: Vec<TaskId>,
    submission_closed: bool,
    cancelled: bool,
    /// A Fail-policy task did not complete; barriers surface this
    failed: bool,
    /// Plain barriers released when outstanding returns to zero
    barrier_waiters: Vec<Waiter>,
    /// Phase-2 end-of-app waiters
    end_waiters: Vec<Waiter>,
    groups: HashMap<GroupName, GroupState>,
}

impl Application {
    fn new() -> Self {
        Self {
            state: AppState::Registered,
            outstanding: 0,
            tasks: Vec::new(),
            submission_closed: false,
            cancelled: false,
            failed: false,
            barrier_waiters: Vec::new(),
            end_waiters: Vec::new(),
            groups: HashMap::new(),
        }
    }

    fn verdict(&self, id: AppId) -> Result<(), AppError> {
        if self.failed {
            Err(AppError::Failed(id))
        } else {
            Ok(())
        }
    }
}

/// What the registry hands back for the caller to fire, in order
#[derive(Debug, Default)]
pub struct Released {
    /// Waiters to complete; `error` decides the verdict they receive
    pub ok: Vec<Waiter>,
    /// Set when the application failed under a Fail-policy task; every
    /// waiter in this batch receives it instead of `Ok`
    pub error: Option<AppError>,
    /// True when this completion drained a stalled app: the caller must
    /// re-acquire minimum resources before firing the end waiters
    pub app_drained: bool,
    /// End-of-app waiters, fired after `ready_to_continue`
    pub end_ok: Vec<Waiter>,
}

// ============================================================================
// REGISTRY
// ============================================================================

/// All applications known to this runtime
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: HashMap<AppId, Application>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn app_mut(&mut self, id: AppId) -> &mut Application {
        self.apps.entry(id).or_insert_with(Application::new)
    }

    pub fn state(&self, id: AppId) -> Option<AppState> {
        self.apps.get(&id).map(|a| a.state)
    }

    pub fn outstanding(&self, id: AppId) -> usize {
        self.apps.get(&id).map(|a| a.outstanding).unwrap_or(0)
    }

    pub fn is_cancelled(&self, id: AppId) -> bool {
        self.apps.get(&id).map(|a| a.cancelled).unwrap_or(false)
    }

    /// Whether `id` still accepts submissions
    pub fn can_submit(&self, id: AppId) -> Result<(), AppError> {
        match self.apps.get(&id) {
            Some(app) if app.cancelled => Err(AppError::Cancelled(id)),
            Some(app) if app.submission_closed => Err(AppError::SubmissionClosed(id)),
            _ => Ok(()),
        }
    }

    /// Account one submission; rejected once end-of-app or cancel arrived
    pub fn task_submitted(
        &mut self,
        id: AppId,
        task: TaskId,
        group: Option<&GroupName>,
    ) -> Result<(), AppError> {
        let app = self.app_mut(id);
        if app.cancelled {
            return Err(AppError::Cancelled(id));
        }
        if app.submission_closed {
            return Err(AppError::SubmissionClosed(id));
        }
        app.state = AppState::Running;
        app.outstanding += 1;
        app.tasks.push(task);
        if let Some(group) = group {
            app.groups.entry(group.clone()).or_default().outstanding += 1;
        }
        Ok(())
    }

    /// A Fail-policy task did not complete; the app surfaces the failure
    pub fn task_failed(&mut self, id: AppId) {
        self.app_mut(id).failed = true;
    }

    pub fn is_failed(&self, id: AppId) -> bool {
        self.apps.get(&id).map(|a| a.failed).unwrap_or(false)
    }

    /// Account one terminal task; returns the waiters this completion frees
    pub fn task_finished(&mut self, id: AppId, group: Option<&GroupName>) -> Released {
        let mut released = Released::default();
        let Some(app) = self.apps.get_mut(&id) else {
            return released;
        };

        app.outstanding = app.outstanding.saturating_sub(1);
        if app.failed {
            released.error = Some(AppError::Failed(id));
        }

        if let Some(group) = group {
            if let Some(state) = app.groups.get_mut(group) {
                state.outstanding = state.outstanding.saturating_sub(1);
                if state.outstanding == 0 {
                    released.ok.append(&mut state.waiters);
                }
            }
        }

        if app.outstanding == 0 {
            released.ok.append(&mut app.barrier_waiters);
            if app.submission_closed {
                released.app_drained = app.state == AppState::Stalled;
                app.state = AppState::Terminated;
                released.end_ok.append(&mut app.end_waiters);
                debug!(app = %id, "Application drained");
            }
        }

        released
    }

    /// Park a caller until every outstanding task of `id` is terminal
    ///
    /// Released immediately when nothing is outstanding.
    pub fn barrier(&mut self, id: AppId, waiter: Waiter) {
        let app = self.app_mut(id);
        if app.cancelled {
            let _ = waiter.send(Err(AppError::Cancelled(id)));
        } else if app.outstanding == 0 {
            let _ = waiter.send(app.verdict(id));
        } else {
            app.barrier_waiters.push(waiter);
        }
    }

    /// Park a caller until the named group drains
    pub fn barrier_group(&mut self, id: AppId, group: GroupName, waiter: Waiter) {
        let app = self.app_mut(id);
        if app.cancelled {
            let _ = waiter.send(Err(AppError::Cancelled(id)));
            return;
        }
        let verdict = app.verdict(id);
        let state = app.groups.entry(group).or_default();
        if state.outstanding == 0 {
            let _ = waiter.send(verdict);
        } else {
            state.waiters.push(waiter);
        }
    }

    /// Phase 1 of end-of-app: close submissions
    ///
    /// Returns true when the app still has tasks and therefore stalled;
    /// the caller may release held resources. With nothing outstanding the
    /// waiter fires immediately and the app terminates.
    pub fn end_of_app(&mut self, id: AppId, waiter: Waiter) -> bool {
        let app = self.app_mut(id);
        if app.cancelled {
            let _ = waiter.send(Err(AppError::Cancelled(id)));
            return false;
        }
        app.submission_closed = true;
        if app.outstanding == 0 {
            app.state = AppState::Terminated;
            let _ = waiter.send(app.verdict(id));
            false
        } else {
            app.state = AppState::Stalled;
            app.end_waiters.push(waiter);
            debug!(app = %id, outstanding = app.outstanding, "Application stalled");
            true
        }
    }

    /// Cancel: fail every parked waiter and close the app
    ///
    /// Returns the task ids the scheduler must cancel.
    pub fn cancel(&mut self, id: AppId) -> Vec<TaskId> {
        let app = self.app_mut(id);
        app.cancelled = true;
        app.submission_closed = true;
        app.state = AppState::Terminated;

        for waiter in app
            .barrier_waiters
            .drain(..)
            .chain(app.end_waiters.drain(..))
            .chain(app.groups.values_mut().flat_map(|g| g.waiters.drain(..)))
        {
            let _ = waiter.send(Err(AppError::Cancelled(id)));
        }
        app.outstanding = 0;
        std::mem::take(&mut app.tasks)
    }
}

// ============================================================================
// TESTS
// ============================================================================
