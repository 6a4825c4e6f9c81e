use serde::{Deserialize, Serialize};

use crate::error::{JobMgrError, Result};
use crate::job::GoalState;

const MAX_NAME_LEN: usize = 128;
const MAX_INSTANCE_COUNT: u32 = 10_000;

/// Resources requested by each task of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub cpus: f64,
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
}

impl Default for ResourceShape {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            memory_mb: 128,
            disk_mb: 0,
        }
    }
}

/// How many LOST/FAILED outcomes a task may have before reconciliation stops
/// relaunching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub max_failures: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self { max_failures: 3 }
    }
}

/// Definition of a job as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub instance_count: u32,
    pub command: String,
    #[serde(default)]
    pub resources: ResourceShape,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default = "default_initial_goal")]
    pub initial_goal: GoalState,
}

fn default_initial_goal() -> GoalState {
    GoalState::Running
}

impl JobSpec {
    pub fn new(name: impl Into<String>, instance_count: u32, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_count,
            command: command.into(),
            resources: ResourceShape::default(),
            restart_policy: RestartPolicy::default(),
            initial_goal: GoalState::Running,
        }
    }

    pub fn with_resources(mut self, resources: ResourceShape) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_restart_policy(mut self, max_failures: u32) -> Self {
        self.restart_policy = RestartPolicy { max_failures };
        self
    }

    pub fn with_initial_goal(mut self, goal: GoalState) -> Self {
        self.initial_goal = goal;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(JobMgrError::Validation("name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(JobMgrError::Validation(format!(
                "name must be at most {} characters",
                MAX_NAME_LEN
            )));
        }
        if self.instance_count == 0 || self.instance_count > MAX_INSTANCE_COUNT {
            return Err(JobMgrError::Validation(format!(
                "instance_count must be between 1 and {}",
                MAX_INSTANCE_COUNT
            )));
        }
        if self.command.trim().is_empty() {
            return Err(JobMgrError::Validation("command must not be empty".into()));
        }
        if !self.resources.cpus.is_finite() || self.resources.cpus <= 0.0 {
            return Err(JobMgrError::Validation("resources.cpus must be > 0".into()));
        }
        if self.resources.memory_mb == 0 {
            return Err(JobMgrError::Validation(
                "resources.memory_mb must be > 0".into(),
            ));
        }
        Ok(())
    }
}
