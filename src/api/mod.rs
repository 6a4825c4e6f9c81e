//! Goal-state API.
//!
//! Callers declare what a job should be doing; they never launch or kill
//! tasks themselves. Every operation is a durable write of desired state
//! followed by a wake-up of the reconciler, which does the actual work.
//! `stop` and `start` return as soon as the new goal is persisted; use
//! [`GoalStateApi::wait_for_state`] to wait for convergence.

pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::JobMgrConfig;
use crate::error::{JobMgrError, Result};
use crate::job::{GoalState, JobRecord, JobSpec, TaskRecord, TaskState};
use crate::reconciler::Reconciler;
use crate::store::StateStore;

/// A job with the current state of each of its tasks.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    #[serde(flatten)]
    pub job: JobRecord,
    pub tasks: Vec<TaskRecord>,
    /// Number of tasks in each actual state
    pub state_counts: BTreeMap<TaskState, usize>,
    /// Outstanding retries of unconfirmed directives, summed over tasks
    pub retries: u64,
    /// LOST/FAILED outcomes since the goal last changed, summed over tasks
    pub failures: u64,
    pub converged: bool,
}

impl JobStatus {
    fn new(job: JobRecord, tasks: Vec<TaskRecord>) -> Self {
        let mut state_counts = BTreeMap::new();
        for task in &tasks {
            *state_counts.entry(task.actual).or_insert(0) += 1;
        }
        let retries = tasks.iter().map(|t| u64::from(t.retry_count)).sum();
        let failures = tasks.iter().map(|t| u64::from(t.failure_count)).sum();
        let converged = tasks.iter().all(|t| reaches_goal(t, job.goal_state));
        Self {
            job,
            tasks,
            state_counts,
            retries,
            failures,
            converged,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub name: String,
    pub instance_count: u32,
    pub goal_state: GoalState,
    pub created_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobSummary {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id,
            name: job.spec.name.clone(),
            instance_count: job.spec.instance_count,
            goal_state: job.goal_state,
            created_at: job.created_at,
        }
    }
}

fn reaches_goal(task: &TaskRecord, goal: GoalState) -> bool {
    task.pending.is_none() && goal.is_satisfied_by(task.actual, task.desired)
}

#[derive(Clone)]
pub struct GoalStateApi {
    store: Arc<StateStore>,
    reconciler: Option<Arc<Reconciler>>,
    poll_interval: Duration,
}

impl GoalStateApi {
    /// An API over `store` alone. Goal changes are picked up by the
    /// reconciler's next sweep, wherever it runs.
    pub fn new(store: Arc<StateStore>, config: &JobMgrConfig) -> Self {
        Self {
            store,
            reconciler: None,
            poll_interval: config.wait_poll_interval(),
        }
    }

    /// Wake `reconciler` directly on every goal change.
    pub fn with_reconciler(mut self, reconciler: Arc<Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Validate and persist a new job together with one task per instance.
    pub fn create(&self, spec: JobSpec) -> Result<Uuid> {
        spec.validate()?;
        let job = JobRecord::new(spec);
        let tasks = job.initial_tasks();
        self.store.create_job(&job, &tasks)?;

        tracing::info!(
            job_id = %job.id,
            name = %job.spec.name,
            instances = job.spec.instance_count,
            goal = %job.goal_state,
            "Job created"
        );
        self.notify(job.id);
        Ok(job.id)
    }

    /// Set the job's goal to KILLED. Idempotent.
    pub fn stop(&self, job_id: Uuid) -> Result<()> {
        self.set_goal(job_id, GoalState::Killed)
    }

    /// Set the job's goal to RUNNING. Idempotent.
    pub fn start(&self, job_id: Uuid) -> Result<()> {
        self.set_goal(job_id, GoalState::Running)
    }

    pub fn set_goal(&self, job_id: Uuid, goal: GoalState) -> Result<()> {
        let changed = self.store.set_job_goal(&job_id, goal)?;
        if changed == 0 {
            tracing::debug!(job_id = %job_id, goal = %goal, "Goal already set");
            return Ok(());
        }
        tracing::info!(job_id = %job_id, goal = %goal, tasks = changed, "Job goal changed");
        self.notify(job_id);
        Ok(())
    }

    /// Wait until every task of the job has reached `goal`.
    ///
    /// For KILLED, LOST and FAILED tasks count as stopped. Tasks with an
    /// unverified directive never count. The wait reflects what the store
    /// says, so it is only as current as the reconciler's last write.
    pub async fn wait_for_state(
        &self,
        job_id: Uuid,
        goal: GoalState,
        timeout: Duration,
    ) -> Result<JobStatus> {
        let started = tokio::time::Instant::now();
        let poll = async {
            loop {
                let status = self.get_job(job_id)?;
                if status.tasks.iter().all(|t| reaches_goal(t, goal)) {
                    return Ok::<_, JobMgrError>(status);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(job_id = %job_id, goal = %goal, waited_ms, "Wait for goal state timed out");
                Err(JobMgrError::Timeout {
                    job_id,
                    goal,
                    waited_ms,
                })
            }
        }
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<JobStatus> {
        let job = self
            .store
            .get_job(&job_id)?
            .ok_or(JobMgrError::JobNotFound(job_id))?;
        let tasks = self.store.list_by_job(&job_id)?;
        Ok(JobStatus::new(job, tasks))
    }

    pub fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        Ok(self.store.list_jobs()?.iter().map(JobSummary::from).collect())
    }

    /// Remove a job whose tasks have all stopped.
    pub fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.store.delete_job(&job_id)?;
        if let Some(reconciler) = &self.reconciler {
            reconciler.retire(job_id);
        }
        tracing::info!(job_id = %job_id, "Job deleted");
        Ok(())
    }

    fn notify(&self, job_id: Uuid) {
        if let Some(reconciler) = &self.reconciler {
            reconciler.goal_changed(job_id);
        }
    }
}
