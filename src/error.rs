use thiserror::Error;
use uuid::Uuid;

use crate::job::{GoalState, TaskId};
use crate::master::MasterError;

#[derive(Error, Debug)]
pub enum JobMgrError {
    #[error("Invalid job spec: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Version conflict on task {task}: expected {expected}, found {actual}")]
    Conflict {
        task: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("Timed out after {waited_ms}ms waiting for job {job_id} to reach {goal}")]
    Timeout {
        job_id: Uuid,
        goal: GoalState,
        waited_ms: u64,
    },

    #[error("Job {0} still has live tasks")]
    JobNotTerminal(Uuid),

    #[error("Master error: {0}")]
    Master(#[from] MasterError),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JobMgrError>;
