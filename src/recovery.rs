//! Startup recovery.
//!
//! Runs once before the reconciler starts. It rebuilds nothing in memory
//! beyond a report: all state lives in the store. What it does do is resolve
//! the pending-action markers left by a previous process, so directives that
//! were in flight when it stopped are neither lost nor repeated.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::master::{MasterError, TimedMaster};
use crate::reconciler::action::resolve_pending;
use crate::store::StateStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub jobs: usize,
    pub tasks: usize,
    /// Markers whose outcome was settled by querying the master
    pub markers_resolved: usize,
    /// Markers left in place because the master was unreachable; the
    /// reconciler verifies them once it is back
    pub markers_deferred: usize,
    /// Jobs with at least one task that still has work to do
    pub jobs_with_work: Vec<Uuid>,
    /// Wall time spent in recovery
    pub duration_ms: u64,
}

pub struct Recovery {
    store: Arc<StateStore>,
    master: TimedMaster,
    conflict_retries: u32,
}

impl Recovery {
    pub fn new(store: Arc<StateStore>, master: TimedMaster, conflict_retries: u32) -> Self {
        Self {
            store,
            master,
            conflict_retries,
        }
    }

    pub async fn run(&self) -> Result<RecoveryReport> {
        let started = tokio::time::Instant::now();
        let mut report = RecoveryReport {
            jobs: self.store.count_jobs()?,
            tasks: self.store.count_tasks()?,
            ..RecoveryReport::default()
        };

        for task in self.store.list_pending()? {
            let Some(pending) = task.pending.clone() else {
                continue;
            };

            let observed = self.master.query(pending.handle()).await;
            if let Err(MasterError::Unavailable(reason)) = &observed {
                tracing::warn!(
                    task_id = %task.id,
                    action = pending.kind(),
                    reason = %reason,
                    "Master unavailable, leaving directive unverified"
                );
                report.markers_deferred += 1;
                continue;
            }

            let resolved = self.store.update_task(&task.id, self.conflict_retries, |t| {
                resolve_pending(t, &pending, &observed);
            })?;
            tracing::info!(
                task_id = %task.id,
                action = pending.kind(),
                handle = %pending.handle(),
                state = %resolved.actual,
                "Resolved directive from previous run"
            );
            report.markers_resolved += 1;
        }

        let with_work: BTreeSet<Uuid> = self
            .store
            .scan_desired_not_actual()?
            .into_iter()
            .map(|task| task.id.job_id)
            .collect();
        report.jobs_with_work = with_work.into_iter().collect();
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            jobs = report.jobs,
            tasks = report.tasks,
            resolved = report.markers_resolved,
            deferred = report.markers_deferred,
            pending_jobs = report.jobs_with_work.len(),
            duration_ms = report.duration_ms,
            "Recovery complete"
        );
        Ok(report)
    }
}
