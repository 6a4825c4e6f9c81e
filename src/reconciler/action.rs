//! Pure decision rules of the reconciler.
//!
//! Everything here works on a single [`TaskRecord`] and never talks to the
//! master or the store, so the rules can be tested without a runtime.

use chrono::{DateTime, Duration, Utc};

use crate::job::{GoalState, PendingAction, RestartPolicy, TaskRecord, TaskState};
use crate::master::{MasterError, MasterHandle, StatusUpdate};

/// What the reconciler should do next for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Desired and actual agree, or the task is halted.
    NoAction,
    /// The outcome of the last directive is unknown; query before anything else.
    Verify(PendingAction),
    Launch,
    Kill(MasterHandle),
    /// Nothing runs on the master for this task; record KILLED directly.
    MarkKilled,
    /// The restart policy is exhausted; stop relaunching.
    Halt,
    /// Stuck in a transient state; ask the master for the current state.
    Query(MasterHandle),
    /// A status update is expected before `until`.
    Wait { until: DateTime<Utc> },
}

pub fn next_action(
    task: &TaskRecord,
    policy: &RestartPolicy,
    now: DateTime<Utc>,
    transient_timeout: Duration,
) -> TaskAction {
    if let Some(pending) = &task.pending {
        return TaskAction::Verify(pending.clone());
    }
    if !task.needs_reconcile() || task.halted {
        return TaskAction::NoAction;
    }

    match (task.desired, task.actual) {
        (GoalState::Running, TaskState::Initialized | TaskState::Pending | TaskState::Killed) => {
            TaskAction::Launch
        }
        (GoalState::Running, TaskState::Lost | TaskState::Failed) => {
            if task.failure_count > policy.max_failures {
                TaskAction::Halt
            } else {
                TaskAction::Launch
            }
        }
        (GoalState::Killed, TaskState::Launching | TaskState::Running) => {
            match &task.master_handle {
                Some(handle) => TaskAction::Kill(handle.clone()),
                None => TaskAction::MarkKilled,
            }
        }
        (
            GoalState::Killed,
            TaskState::Initialized | TaskState::Pending | TaskState::Lost | TaskState::Failed,
        ) => TaskAction::MarkKilled,
        (_, TaskState::Launching | TaskState::Killing) => {
            let until = task.updated_at + transient_timeout;
            match &task.master_handle {
                Some(handle) if now >= until => TaskAction::Query(handle.clone()),
                Some(_) => TaskAction::Wait { until },
                None => TaskAction::NoAction,
            }
        }
        // Remaining pairs are converged and were handled above
        _ => TaskAction::NoAction,
    }
}

/// Apply a state reported by the master, following the state graph.
///
/// A task we still consider PENDING may be reported past LAUNCHING already;
/// that edge is bridged. Reports that would move the task backwards are stale
/// and ignored. Returns whether the record changed.
pub fn adopt_reported_state(task: &mut TaskRecord, reported: TaskState) -> bool {
    let before = task.actual;
    if before == reported {
        return false;
    }

    let moved = if before.can_transition_to(reported) {
        task.transition(reported)
    } else if before == TaskState::Pending && TaskState::Launching.can_transition_to(reported) {
        task.transition(TaskState::Launching) && task.transition(reported)
    } else {
        false
    };

    if moved && matches!(reported, TaskState::Lost | TaskState::Failed) {
        task.failure_count += 1;
    }
    moved
}

/// Resolve an unverified directive with what the master reported for its
/// handle. `observed` is the result of a query; callers must not pass
/// `MasterError::Unavailable`, which leaves the marker in place.
///
/// Does nothing when the record no longer carries `pending`.
pub fn resolve_pending(
    task: &mut TaskRecord,
    pending: &PendingAction,
    observed: &Result<TaskState, MasterError>,
) {
    if task.pending.as_ref() != Some(pending) {
        return;
    }

    match (pending, observed) {
        (_, Err(MasterError::Unavailable(_))) => {}

        // The launch reached the master
        (PendingAction::Launch(handle), Ok(state)) => {
            task.clear_pending();
            task.master_handle = Some(handle.clone());
            adopt_reported_state(task, *state);
        }
        // It never did; the next pass decides again from the latest goal
        (PendingAction::Launch(_), Err(_)) => {
            task.clear_pending();
        }

        (PendingAction::Kill(_), Ok(state)) => {
            task.clear_pending();
            if !state.is_live() {
                adopt_reported_state(task, *state);
            }
        }
        // The master no longer knows the instance, so nothing runs
        (PendingAction::Kill(handle), Err(_)) => {
            task.clear_pending();
            if task.master_handle.as_ref() == Some(handle) {
                task.transition(TaskState::Killed);
            }
        }
    }
}

/// Fold a status update into a task. Returns whether the record changed.
pub fn apply_status_update(task: &mut TaskRecord, update: &StatusUpdate) -> bool {
    let before = task.clone();

    match task.pending.clone() {
        Some(PendingAction::Launch(handle)) if handle == update.handle => {
            // Proof that the launch reached the master
            task.clear_pending();
            task.master_handle = Some(handle);
        }
        Some(PendingAction::Launch(_)) => {
            // A previous run reporting while the next launch is unverified
            return false;
        }
        Some(PendingAction::Kill(handle)) if handle == update.handle => {
            if update.state.is_live() {
                // Sent before the kill landed; verification decides
                return false;
            }
            task.clear_pending();
        }
        _ => {}
    }

    if task.master_handle.as_ref() != Some(&update.handle) {
        // Update for an older run of the task
        return false;
    }

    if adopt_reported_state(task, update.state) {
        if let Some(message) = &update.message {
            task.message = Some(message.clone());
        }
    }
    *task != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskId;
    use uuid::Uuid;

    fn task(desired: GoalState, actual: TaskState) -> TaskRecord {
        let mut t = TaskRecord::new(TaskId::new(Uuid::new_v4(), 0), desired);
        t.actual = actual;
        if !matches!(actual, TaskState::Initialized | TaskState::Pending) {
            t.master_handle = Some(t.id.handle_for_run(1));
            t.run_id = 1;
        }
        t
    }

    fn decide(t: &TaskRecord) -> TaskAction {
        next_action(t, &RestartPolicy::default(), Utc::now(), Duration::seconds(30))
    }

    #[test]
    fn launches_when_running_desired() {
        for actual in [
            TaskState::Initialized,
            TaskState::Pending,
            TaskState::Killed,
            TaskState::Lost,
            TaskState::Failed,
        ] {
            assert_eq!(decide(&task(GoalState::Running, actual)), TaskAction::Launch);
        }
    }

    #[test]
    fn kills_live_tasks_when_killed_desired() {
        for actual in [TaskState::Launching, TaskState::Running] {
            let t = task(GoalState::Killed, actual);
            let handle = t.master_handle.clone().unwrap();
            assert_eq!(decide(&t), TaskAction::Kill(handle));
        }
    }

    #[test]
    fn marks_killed_without_master_instance() {
        for actual in [
            TaskState::Initialized,
            TaskState::Pending,
            TaskState::Lost,
            TaskState::Failed,
        ] {
            assert_eq!(decide(&task(GoalState::Killed, actual)), TaskAction::MarkKilled);
        }
    }

    #[test]
    fn converged_and_halted_tasks_need_nothing() {
        assert_eq!(decide(&task(GoalState::Running, TaskState::Running)), TaskAction::NoAction);
        assert_eq!(decide(&task(GoalState::Killed, TaskState::Killed)), TaskAction::NoAction);

        let mut halted = task(GoalState::Running, TaskState::Failed);
        halted.halted = true;
        assert_eq!(decide(&halted), TaskAction::NoAction);
    }

    #[test]
    fn pending_marker_always_verifies_first() {
        let mut t = task(GoalState::Killed, TaskState::Running);
        let marker = PendingAction::Kill(t.master_handle.clone().unwrap());
        t.pending = Some(marker.clone());
        assert_eq!(decide(&t), TaskAction::Verify(marker));
    }

    #[test]
    fn transient_state_waits_then_queries() {
        let t = task(GoalState::Running, TaskState::Launching);
        let handle = t.master_handle.clone().unwrap();
        let policy = RestartPolicy::default();

        let early = next_action(&t, &policy, t.updated_at, Duration::seconds(30));
        assert_eq!(
            early,
            TaskAction::Wait {
                until: t.updated_at + Duration::seconds(30)
            }
        );

        let late = next_action(
            &t,
            &policy,
            t.updated_at + Duration::seconds(31),
            Duration::seconds(30),
        );
        assert_eq!(late, TaskAction::Query(handle));
    }

    #[test]
    fn restart_policy_halts_after_max_failures() {
        let mut t = task(GoalState::Running, TaskState::Lost);
        t.failure_count = 3;
        assert_eq!(decide(&t), TaskAction::Launch);
        t.failure_count = 4;
        assert_eq!(decide(&t), TaskAction::Halt);
    }

    #[test]
    fn adopt_bridges_pending_to_running() {
        let mut t = task(GoalState::Running, TaskState::Pending);
        assert!(adopt_reported_state(&mut t, TaskState::Running));
        assert_eq!(t.actual, TaskState::Running);
    }

    #[test]
    fn adopt_ignores_backwards_reports() {
        let mut t = task(GoalState::Killed, TaskState::Killing);
        assert!(!adopt_reported_state(&mut t, TaskState::Running));
        assert_eq!(t.actual, TaskState::Killing);

        let mut t = task(GoalState::Running, TaskState::Running);
        assert!(!adopt_reported_state(&mut t, TaskState::Launching));
    }

    #[test]
    fn adopt_counts_failures() {
        let mut t = task(GoalState::Running, TaskState::Running);
        assert!(adopt_reported_state(&mut t, TaskState::Lost));
        assert_eq!(t.failure_count, 1);
    }

    #[test]
    fn resolve_launch_that_reached_master() {
        let mut t = task(GoalState::Running, TaskState::Pending);
        let handle = t.id.handle_for_run(1);
        let marker = PendingAction::Launch(handle.clone());
        t.pending = Some(marker.clone());
        t.retry_count = 2;

        resolve_pending(&mut t, &marker, &Ok(TaskState::Running));
        assert!(t.pending.is_none());
        assert_eq!(t.retry_count, 0);
        assert_eq!(t.master_handle, Some(handle));
        assert_eq!(t.actual, TaskState::Running);
    }

    #[test]
    fn resolve_launch_that_never_reached_master() {
        let mut t = task(GoalState::Running, TaskState::Pending);
        let handle = t.id.handle_for_run(1);
        let marker = PendingAction::Launch(handle.clone());
        t.pending = Some(marker.clone());

        resolve_pending(&mut t, &marker, &Err(MasterError::UnknownHandle(handle)));
        assert!(t.pending.is_none());
        assert!(t.master_handle.is_none());
        assert_eq!(t.actual, TaskState::Pending);
    }

    #[test]
    fn resolve_kill_keeps_marker_while_unavailable() {
        let mut t = task(GoalState::Killed, TaskState::Running);
        let marker = PendingAction::Kill(t.master_handle.clone().unwrap());
        t.pending = Some(marker.clone());

        resolve_pending(&mut t, &marker, &Err(MasterError::Unavailable("down".into())));
        assert_eq!(t.pending, Some(marker));
    }

    #[test]
    fn resolve_kill_that_landed() {
        let mut t = task(GoalState::Killed, TaskState::Running);
        let marker = PendingAction::Kill(t.master_handle.clone().unwrap());
        t.pending = Some(marker.clone());

        resolve_pending(&mut t, &marker, &Ok(TaskState::Killing));
        assert!(t.pending.is_none());
        assert_eq!(t.actual, TaskState::Killing);
    }

    #[test]
    fn resolve_kill_that_did_not_land() {
        let mut t = task(GoalState::Killed, TaskState::Running);
        let marker = PendingAction::Kill(t.master_handle.clone().unwrap());
        t.pending = Some(marker.clone());

        resolve_pending(&mut t, &marker, &Ok(TaskState::Running));
        assert!(t.pending.is_none());
        assert_eq!(t.actual, TaskState::Running);
        assert_eq!(decide(&t), TaskAction::Kill(t.master_handle.clone().unwrap()));
    }

    #[test]
    fn resolve_kill_of_forgotten_instance() {
        let mut t = task(GoalState::Killed, TaskState::Running);
        let handle = t.master_handle.clone().unwrap();
        let marker = PendingAction::Kill(handle.clone());
        t.pending = Some(marker.clone());

        resolve_pending(&mut t, &marker, &Err(MasterError::UnknownHandle(handle)));
        assert_eq!(t.actual, TaskState::Killed);
    }

    #[test]
    fn status_update_for_old_run_is_ignored() {
        let mut t = task(GoalState::Running, TaskState::Running);
        let update = StatusUpdate {
            handle: t.id.handle_for_run(0),
            state: TaskState::Killed,
            message: None,
        };
        assert!(!apply_status_update(&mut t, &update));
        assert_eq!(t.actual, TaskState::Running);
    }

    #[test]
    fn status_update_resolves_launch_marker() {
        let mut t = task(GoalState::Running, TaskState::Pending);
        let handle = t.id.handle_for_run(1);
        t.pending = Some(PendingAction::Launch(handle.clone()));

        let update = StatusUpdate {
            handle: handle.clone(),
            state: TaskState::Launching,
            message: None,
        };
        assert!(apply_status_update(&mut t, &update));
        assert!(t.pending.is_none());
        assert_eq!(t.master_handle, Some(handle));
        assert_eq!(t.actual, TaskState::Launching);
    }

    #[test]
    fn previous_run_update_is_ignored_during_relaunch() {
        let mut t = task(GoalState::Running, TaskState::Pending);
        let old = t.id.handle_for_run(1);
        let next = t.id.handle_for_run(2);
        t.master_handle = Some(old.clone());
        t.run_id = 2;
        let marker = PendingAction::Launch(next.clone());
        t.pending = Some(marker.clone());

        let late = StatusUpdate {
            handle: old,
            state: TaskState::Killed,
            message: None,
        };
        assert!(!apply_status_update(&mut t, &late));
        assert_eq!(t.actual, TaskState::Pending);
        assert_eq!(t.pending, Some(marker.clone()));

        // The relaunch is found alive and adopted instead of launched again
        resolve_pending(&mut t, &marker, &Ok(TaskState::Running));
        assert_eq!(t.actual, TaskState::Running);
        assert_eq!(t.master_handle, Some(next));
        assert_eq!(decide(&t), TaskAction::NoAction);
    }

    #[test]
    fn stale_running_update_does_not_override_pending_kill() {
        let mut t = task(GoalState::Killed, TaskState::Running);
        let handle = t.master_handle.clone().unwrap();
        t.pending = Some(PendingAction::Kill(handle.clone()));

        let update = StatusUpdate {
            handle,
            state: TaskState::Running,
            message: None,
        };
        assert!(!apply_status_update(&mut t, &update));
        assert!(t.pending.is_some());
    }

    #[test]
    fn killed_update_completes_kill() {
        let mut t = task(GoalState::Killed, TaskState::Killing);
        let update = StatusUpdate {
            handle: t.master_handle.clone().unwrap(),
            state: TaskState::Killed,
            message: None,
        };
        assert!(apply_status_update(&mut t, &update));
        assert_eq!(t.actual, TaskState::Killed);
        assert!(!t.needs_reconcile());
    }
}
