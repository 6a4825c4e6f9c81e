pub mod spec;
pub mod state;
pub mod task;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use spec::{JobSpec, ResourceShape, RestartPolicy};
pub use state::{GoalState, TaskState};
pub use task::{PendingAction, TaskId, TaskRecord};

/// A job and its desired goal. Only the goal changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub spec: JobSpec,
    pub goal_state: GoalState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal_state: spec.initial_goal,
            spec,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fresh task records for every instance of this job.
    pub fn initial_tasks(&self) -> Vec<TaskRecord> {
        (0..self.spec.instance_count)
            .map(|instance| TaskRecord::new(TaskId::new(self.id, instance), self.goal_state))
            .collect()
    }
}
