use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::action::{self, TaskAction};
use super::Shared;
use crate::error::{JobMgrError, Result};
use crate::job::{JobSpec, PendingAction, TaskId, TaskRecord, TaskState};
use crate::master::{LaunchRequest, MasterError, MasterHandle, StatusUpdate};

/// Upper bound on actions taken for one task in a single pass.
const MAX_STEPS_PER_PASS: usize = 8;

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Look at the job again
    Wake,
    /// The job's goal changed; tasks waiting out a backoff are retried now
    GoalChanged,
    Status(StatusUpdate),
    /// The job was deleted
    Retire,
}

/// Result of one action on a task.
enum Step {
    /// The record changed; decide again
    Continue(TaskRecord),
    /// The master was unavailable; retry number `n` after backoff
    Backoff(u32),
    /// Nothing to do before this instant unless an event arrives
    WaitUntil(Instant),
    Idle,
}

/// Reconciles the tasks of one job.
///
/// A job has exactly one worker, and all writes of actual state for its tasks
/// happen on it. Status updates are routed here instead of being applied by
/// the ingestion loop, so a status update can never race with the recording
/// of a directive's result.
pub(crate) struct JobWorker {
    job_id: Uuid,
    shared: Arc<Shared>,
    spec: Option<JobSpec>,
    /// Instances waiting out a backoff, and when they may be retried
    retry_at: HashMap<u32, Instant>,
}

impl JobWorker {
    pub(crate) fn new(job_id: Uuid, shared: Arc<Shared>) -> Self {
        Self {
            job_id,
            shared,
            spec: None,
            retry_at: HashMap::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        cancel: CancellationToken,
    ) {
        tracing::debug!(job_id = %self.job_id, "Job worker started");
        let mut next_wake = Some(Instant::now());

        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => Some(event),
                    None => break,
                },
                _ = sleep_until(next_wake) => None,
            };

            // Coalesce whatever else is queued into this pass
            let mut batch: Vec<WorkerEvent> = first.into_iter().collect();
            while let Ok(event) = events.try_recv() {
                batch.push(event);
            }
            if !self.handle_events(batch) {
                break;
            }

            next_wake = match self.reconcile_pass().await {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Reconcile pass failed");
                    Some(Instant::now() + self.shared.config.reconcile_interval())
                }
            };
        }

        tracing::debug!(job_id = %self.job_id, "Job worker stopped");
    }

    /// Returns false when the worker should stop.
    fn handle_events(&mut self, batch: Vec<WorkerEvent>) -> bool {
        for event in batch {
            match event {
                WorkerEvent::Wake => {}
                WorkerEvent::GoalChanged => self.retry_at.clear(),
                WorkerEvent::Status(update) => self.apply_status(&update),
                WorkerEvent::Retire => return false,
            }
        }
        true
    }

    fn apply_status(&mut self, update: &StatusUpdate) {
        let task = match self.shared.store.get_by_handle(&update.handle) {
            Ok(Some(task)) if task.id.job_id == self.job_id => task,
            Ok(_) => {
                tracing::debug!(handle = %update.handle, "Status update for unknown handle ignored");
                return;
            }
            Err(e) => {
                tracing::warn!(handle = %update.handle, error = %e, "Failed to look up status update");
                return;
            }
        };

        match self.update(&task.id, |t| {
            action::apply_status_update(t, update);
        }) {
            Ok(after) if after.version != task.version => {
                tracing::info!(
                    task_id = %after.id,
                    from = %task.actual,
                    to = %after.actual,
                    "Task state reported by master"
                );
                // The master is reachable again
                self.retry_at.remove(&after.id.instance);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to record status update");
            }
        }
    }

    /// One pass over every task of the job. Returns when the worker should
    /// look again without being woken, if ever.
    async fn reconcile_pass(&mut self) -> Result<Option<Instant>> {
        let Some(spec) = self.load_spec()? else {
            return Ok(None);
        };
        let tasks = self.shared.store.list_by_job(&self.job_id)?;

        let mut next_wake = None;
        for task in tasks {
            let instance = task.id.instance;
            if let Some(at) = self.retry_at.get(&instance).copied() {
                if at > Instant::now() {
                    next_wake = earliest(next_wake, at);
                    continue;
                }
                self.retry_at.remove(&instance);
            }

            let task_id = task.id;
            match self.reconcile_task(task, &spec).await {
                Ok(Some(at)) => next_wake = earliest(next_wake, at),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to reconcile task");
                    next_wake = earliest(
                        next_wake,
                        Instant::now() + self.shared.config.reconcile_interval(),
                    );
                }
            }
        }
        Ok(next_wake)
    }

    fn load_spec(&mut self) -> Result<Option<JobSpec>> {
        if let Some(spec) = &self.spec {
            return Ok(Some(spec.clone()));
        }
        let spec = self.shared.store.get_job(&self.job_id)?.map(|job| job.spec);
        self.spec = spec.clone();
        Ok(spec)
    }

    async fn reconcile_task(
        &mut self,
        mut task: TaskRecord,
        spec: &JobSpec,
    ) -> Result<Option<Instant>> {
        let instance = task.id.instance;

        for _ in 0..MAX_STEPS_PER_PASS {
            let action = action::next_action(
                &task,
                &spec.restart_policy,
                Utc::now(),
                self.transient_timeout(),
            );
            let step = match action {
                TaskAction::NoAction => Step::Idle,
                TaskAction::Verify(pending) => self.verify(task, pending).await?,
                TaskAction::Launch => self.launch(task, spec).await?,
                TaskAction::Kill(handle) => self.kill(task, handle).await?,
                TaskAction::MarkKilled => self.mark_killed(task)?,
                TaskAction::Halt => self.halt(task)?,
                TaskAction::Query(handle) => self.query(task, handle).await?,
                TaskAction::Wait { until } => Step::WaitUntil(instant_at(until)),
            };

            match step {
                Step::Continue(next) => task = next,
                Step::Backoff(attempt) => {
                    let at = Instant::now() + self.shared.config.backoff.delay(attempt);
                    self.retry_at.insert(instance, at);
                    return Ok(Some(at));
                }
                Step::WaitUntil(at) => return Ok(Some(at)),
                Step::Idle => return Ok(None),
            }
        }

        Ok(Some(Instant::now() + self.shared.config.reconcile_interval()))
    }

    async fn launch(&mut self, task: TaskRecord, spec: &JobSpec) -> Result<Step> {
        let run_id = task.run_id + 1;
        let handle = task.id.handle_for_run(run_id);
        let marker = PendingAction::Launch(handle.clone());

        let mut intent = task.clone();
        if !intent.transition(TaskState::Pending) {
            return Ok(Step::Idle);
        }
        intent.run_id = run_id;
        intent.pending = Some(marker.clone());
        intent.message = None;
        if self.write_intent(&intent)?.is_none() {
            return self.reload(&task.id);
        }

        let request = LaunchRequest {
            task_id: task.id,
            handle: handle.clone(),
            command: spec.command.clone(),
            resources: spec.resources.clone(),
        };

        match self.shared.master.launch(request).await {
            Ok(assigned) => {
                let updated = self.update(&task.id, |t| {
                    if t.pending.as_ref() == Some(&marker) {
                        t.clear_pending();
                        t.master_handle = Some(assigned.clone());
                        t.transition(TaskState::Launching);
                    }
                })?;
                tracing::info!(task_id = %task.id, handle = %assigned, "Task launched");
                Ok(Step::Continue(updated))
            }
            Err(MasterError::Rejected(reason)) => {
                self.update(&task.id, |t| {
                    if t.pending.as_ref() == Some(&marker) {
                        t.clear_pending();
                        t.transition(TaskState::Failed);
                        t.halted = true;
                        t.message = Some(reason.clone());
                    }
                })?;
                tracing::error!(task_id = %task.id, reason = %reason, "Master rejected launch");
                Ok(Step::Idle)
            }
            Err(e) => self.defer(&task.id, &marker, &e),
        }
    }

    async fn kill(&mut self, task: TaskRecord, handle: MasterHandle) -> Result<Step> {
        let marker = PendingAction::Kill(handle.clone());

        let mut intent = task.clone();
        intent.pending = Some(marker.clone());
        if self.write_intent(&intent)?.is_none() {
            return self.reload(&task.id);
        }

        match self.shared.master.kill(&handle).await {
            Ok(()) => {
                let updated = self.update(&task.id, |t| {
                    if t.pending.as_ref() == Some(&marker) {
                        t.clear_pending();
                        t.transition(TaskState::Killing);
                    }
                })?;
                tracing::info!(task_id = %task.id, handle = %handle, "Kill issued");
                Ok(Step::Continue(updated))
            }
            Err(MasterError::UnknownHandle(unknown)) => {
                let observed: std::result::Result<TaskState, MasterError> =
                    Err(MasterError::UnknownHandle(unknown));
                let updated = self.update(&task.id, |t| {
                    action::resolve_pending(t, &marker, &observed);
                })?;
                tracing::info!(
                    task_id = %task.id,
                    handle = %handle,
                    "Master does not know the instance, task is killed"
                );
                Ok(Step::Continue(updated))
            }
            Err(e) => self.defer(&task.id, &marker, &e),
        }
    }

    /// Find out whether an unconfirmed directive took effect.
    async fn verify(&mut self, task: TaskRecord, pending: PendingAction) -> Result<Step> {
        let observed = self.shared.master.query(pending.handle()).await;
        if let Err(e @ MasterError::Unavailable(_)) = &observed {
            return self.defer(&task.id, &pending, e);
        }

        let updated = self.update(&task.id, |t| {
            action::resolve_pending(t, &pending, &observed);
        })?;
        tracing::info!(
            task_id = %task.id,
            action = pending.kind(),
            handle = %pending.handle(),
            state = %updated.actual,
            "Verified unconfirmed directive"
        );
        Ok(Step::Continue(updated))
    }

    /// Refresh a task that has been LAUNCHING or KILLING for too long.
    async fn query(&mut self, task: TaskRecord, handle: MasterHandle) -> Result<Step> {
        let current = |t: &TaskRecord| t.master_handle.as_ref() == Some(&handle) && t.pending.is_none();

        match self.shared.master.query(&handle).await {
            Ok(reported) => {
                let updated = self.update(&task.id, |t| {
                    if current(t) {
                        t.retry_count = 0;
                        if !action::adopt_reported_state(t, reported) {
                            // Still transient on the master; restart the clock
                            t.updated_at = Utc::now();
                        }
                    }
                })?;
                tracing::debug!(task_id = %task.id, state = %reported, "Queried task in transient state");
                Ok(Step::Continue(updated))
            }
            Err(MasterError::UnknownHandle(_)) => {
                let updated = self.update(&task.id, |t| {
                    if current(t) && action::adopt_reported_state(t, TaskState::Lost) {
                        t.retry_count = 0;
                        t.message = Some("instance unknown to master".to_string());
                    }
                })?;
                tracing::warn!(task_id = %task.id, handle = %handle, "Master lost task instance");
                Ok(Step::Continue(updated))
            }
            Err(e) => {
                let updated = self.update(&task.id, |t| {
                    if current(t) {
                        t.retry_count = t.retry_count.saturating_add(1);
                    }
                })?;
                tracing::warn!(
                    task_id = %task.id,
                    attempt = updated.retry_count,
                    error = %e,
                    "Query failed, will retry"
                );
                Ok(Step::Backoff(updated.retry_count.max(1)))
            }
        }
    }

    fn mark_killed(&mut self, task: TaskRecord) -> Result<Step> {
        let mut next = task.clone();
        if !next.transition(TaskState::Killed) {
            return Ok(Step::Idle);
        }
        match self.write_intent(&next)? {
            Some(stored) => {
                tracing::info!(task_id = %task.id, from = %task.actual, "Task marked killed");
                Ok(Step::Continue(stored))
            }
            None => self.reload(&task.id),
        }
    }

    fn halt(&mut self, task: TaskRecord) -> Result<Step> {
        let mut next = task.clone();
        next.halted = true;
        next.message = Some(format!(
            "restart policy exhausted after {} failures",
            task.failure_count
        ));
        match self.write_intent(&next)? {
            Some(_) => {
                tracing::warn!(
                    task_id = %task.id,
                    failures = task.failure_count,
                    "Task halted, not relaunching"
                );
                Ok(Step::Idle)
            }
            None => self.reload(&task.id),
        }
    }

    /// Keep the marker and back off.
    fn defer(&self, task_id: &TaskId, marker: &PendingAction, err: &MasterError) -> Result<Step> {
        let updated = self.update(task_id, |t| {
            if t.pending.as_ref() == Some(marker) {
                t.retry_count = t.retry_count.saturating_add(1);
            }
        })?;
        tracing::warn!(
            task_id = %task_id,
            action = marker.kind(),
            attempt = updated.retry_count,
            error = %err,
            "Master call failed, will verify before retrying"
        );
        Ok(Step::Backoff(updated.retry_count.max(1)))
    }

    /// Persist a decision against the version it was made from. `None` means
    /// another writer changed the task in between and the decision is stale.
    fn write_intent(&self, next: &TaskRecord) -> Result<Option<TaskRecord>> {
        match self.shared.store.put(next) {
            Ok(stored) => Ok(Some(stored)),
            Err(JobMgrError::Conflict { .. }) => {
                tracing::debug!(task_id = %next.id, "Task changed underneath, deciding again");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn reload(&self, task_id: &TaskId) -> Result<Step> {
        Ok(match self.shared.store.get(task_id)? {
            Some(task) => Step::Continue(task),
            None => Step::Idle,
        })
    }

    /// Record a fact learned from the master, re-applying on conflicts.
    fn update<F>(&self, task_id: &TaskId, mutate: F) -> Result<TaskRecord>
    where
        F: FnMut(&mut TaskRecord),
    {
        self.shared
            .store
            .update_task(task_id, self.shared.config.conflict_retries, mutate)
    }

    fn transient_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.shared.config.transient_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

fn instant_at(at: DateTime<Utc>) -> Instant {
    let remaining = (at - Utc::now()).to_std().unwrap_or_default();
    Instant::now() + remaining
}
