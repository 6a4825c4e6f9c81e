use serde::{Deserialize, Serialize};

/// Actual state of a task, as reported by or inferred from the resource master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Initialized,
    Pending,
    Launching,
    Running,
    Killing,
    Killed,
    Lost,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Initialized,
        TaskState::Pending,
        TaskState::Launching,
        TaskState::Running,
        TaskState::Killing,
        TaskState::Killed,
        TaskState::Lost,
        TaskState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Initialized => "INITIALIZED",
            TaskState::Pending => "PENDING",
            TaskState::Launching => "LAUNCHING",
            TaskState::Running => "RUNNING",
            TaskState::Killing => "KILLING",
            TaskState::Killed => "KILLED",
            TaskState::Lost => "LOST",
            TaskState::Failed => "FAILED",
        }
    }

    /// No instance of the task is alive on the master.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Killed | TaskState::Lost | TaskState::Failed)
    }

    /// An instance may be alive on the master and can be killed.
    pub fn is_live(&self) -> bool {
        matches!(self, TaskState::Launching | TaskState::Running)
    }

    /// Waiting on the master to finish a transition we asked for.
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskState::Launching | TaskState::Killing)
    }

    /// Whether `self -> next` is an edge of the task state graph.
    ///
    /// Self-transitions are accepted as no-ops.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        if *self == next {
            return true;
        }
        match self {
            Initialized => matches!(next, Pending | Killed),
            Pending => matches!(next, Launching | Killed | Failed),
            Launching => matches!(next, Running | Killing | Killed | Lost | Failed),
            Running => matches!(next, Killing | Killed | Lost | Failed),
            Killing => matches!(next, Killed | Lost | Failed),
            Killed => matches!(next, Pending),
            Lost | Failed => matches!(next, Pending | Killed),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task state '{}'", s))
    }
}

/// State a caller wants every task of a job to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GoalState {
    Running,
    Killed,
}

impl GoalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalState::Running => "RUNNING",
            GoalState::Killed => "KILLED",
        }
    }

    /// The actual state that exactly realizes this goal.
    pub fn target(&self) -> TaskState {
        match self {
            GoalState::Running => TaskState::Running,
            GoalState::Killed => TaskState::Killed,
        }
    }

    /// Whether a task in `actual` (with goal `desired`) counts as having reached
    /// this goal. LOST and FAILED satisfy KILLED only when KILLED is also desired.
    pub fn is_satisfied_by(&self, actual: TaskState, desired: GoalState) -> bool {
        if actual == self.target() {
            return true;
        }
        *self == GoalState::Killed
            && desired == GoalState::Killed
            && matches!(actual, TaskState::Lost | TaskState::Failed)
    }
}

impl std::fmt::Display for GoalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GoalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(GoalState::Running),
            "KILLED" => Ok(GoalState::Killed),
            other => Err(format!("unknown goal state '{}'", other)),
        }
    }
}
