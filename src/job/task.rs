use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{GoalState, TaskState};
use crate::master::MasterHandle;

/// Identity of a task: the job it belongs to plus its instance index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub job_id: Uuid,
    pub instance: u32,
}

impl TaskId {
    pub fn new(job_id: Uuid, instance: u32) -> Self {
        Self { job_id, instance }
    }

    /// Handle used for the `run_id`-th launch of this task.
    pub fn handle_for_run(&self, run_id: u64) -> MasterHandle {
        MasterHandle::new(format!("{}-{}-{}", self.job_id, self.instance, run_id))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job_id, self.instance)
    }
}

/// Directive that was written down before being sent to the master.
///
/// A marker that survives a failed call or a crash means the outcome of the
/// directive is unknown and must be verified with a query before anything
/// else is sent for the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "handle", rename_all = "lowercase")]
pub enum PendingAction {
    Launch(MasterHandle),
    Kill(MasterHandle),
}

impl PendingAction {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingAction::Launch(_) => "launch",
            PendingAction::Kill(_) => "kill",
        }
    }

    pub fn handle(&self) -> &MasterHandle {
        match self {
            PendingAction::Launch(handle) | PendingAction::Kill(handle) => handle,
        }
    }

    pub fn from_parts(kind: &str, handle: MasterHandle) -> Option<Self> {
        match kind {
            "launch" => Some(PendingAction::Launch(handle)),
            "kill" => Some(PendingAction::Kill(handle)),
            _ => None,
        }
    }
}

/// Persisted state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub actual: TaskState,
    pub desired: GoalState,
    pub master_handle: Option<MasterHandle>,
    /// Number of launches attempted so far; the next launch uses `run_id + 1`.
    pub run_id: u64,
    /// Consecutive retries of the in-flight action.
    pub retry_count: u32,
    /// LOST/FAILED outcomes since the goal last changed.
    pub failure_count: u32,
    pub pending: Option<PendingAction>,
    /// Set when the master rejected the task or it exhausted its restart
    /// policy. Cleared when the goal changes.
    pub halted: bool,
    pub message: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, desired: GoalState) -> Self {
        Self {
            id,
            actual: TaskState::Initialized,
            desired,
            master_handle: None,
            run_id: 0,
            retry_count: 0,
            failure_count: 0,
            pending: None,
            halted: false,
            message: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether the actual state differs from the desired state.
    pub fn needs_reconcile(&self) -> bool {
        self.actual != self.desired.target()
    }

    /// Move to `next` if the state graph allows it. Returns false and leaves
    /// the record untouched otherwise.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if !self.actual.can_transition_to(next) {
            return false;
        }
        if self.actual != next {
            self.actual = next;
            self.updated_at = Utc::now();
        }
        true
    }

    /// Change the desired state, clearing the bookkeeping tied to the old one.
    /// Returns false when the goal was already `goal`.
    pub fn set_goal(&mut self, goal: GoalState) -> bool {
        if self.desired == goal {
            return false;
        }
        self.desired = goal;
        self.halted = false;
        self.failure_count = 0;
        self.updated_at = Utc::now();
        true
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
        self.retry_count = 0;
    }
}
