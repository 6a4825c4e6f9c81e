//! Goal-state reconciliation.
//!
//! The reconciler drives every task toward its desired state by issuing
//! launch and kill directives to the resource master.
//!
//! # Structure
//!
//! Each job gets one [`JobWorker`](worker::JobWorker) task, spawned on first
//! use. Work reaches a worker three ways:
//!
//! - goal changes made through the API wake it directly
//! - a periodic sweep wakes every job with a task whose actual state differs
//!   from its desired state (or whose last directive is unverified)
//! - status updates from the master are routed to the worker owning the handle
//!
//! # Crash safety
//!
//! Before a directive is sent, a pending-action marker naming it is
//! persisted. The marker is cleared only once the outcome is known. Whenever
//! a worker (or recovery after a restart) finds a marker, it queries the
//! master first and re-issues the directive only if it provably never took
//! effect. A master outage therefore delays convergence but never produces
//! a duplicate directive.

pub mod action;
mod worker;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::JobMgrConfig;
use crate::error::Result;
use crate::master::{subscribe_status_updates, StatusUpdate, TimedMaster};
use crate::store::StateStore;
use worker::{JobWorker, WorkerEvent};

pub use action::TaskAction;

/// State shared by the reconciler and its workers.
pub(crate) struct Shared {
    pub(crate) store: Arc<StateStore>,
    pub(crate) master: TimedMaster,
    pub(crate) config: JobMgrConfig,
}

struct WorkerSlot {
    events: mpsc::UnboundedSender<WorkerEvent>,
    handle: JoinHandle<()>,
}

pub struct Reconciler {
    shared: Arc<Shared>,
    workers: Mutex<HashMap<Uuid, WorkerSlot>>,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        store: Arc<StateStore>,
        master: TimedMaster,
        config: JobMgrConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                store,
                master,
                config,
            }),
            workers: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Ask the job's worker to look at its tasks again.
    pub fn wake(&self, job_id: Uuid) {
        self.send(job_id, WorkerEvent::Wake);
    }

    /// Like [`wake`](Self::wake), but also cancels pending backoffs so the new
    /// goal is acted on immediately.
    pub fn goal_changed(&self, job_id: Uuid) {
        self.send(job_id, WorkerEvent::GoalChanged);
    }

    /// Stop the worker of a deleted job.
    pub fn retire(&self, job_id: Uuid) {
        if let Some(slot) = self.workers().remove(&job_id) {
            let _ = slot.events.send(WorkerEvent::Retire);
        }
    }

    /// Route a status update to the worker owning its handle. Updates for
    /// handles no task knows are dropped.
    pub fn deliver_status(&self, update: StatusUpdate) -> Result<()> {
        match self.shared.store.get_by_handle(&update.handle)? {
            Some(task) => self.send(task.id.job_id, WorkerEvent::Status(update)),
            None => {
                tracing::debug!(handle = %update.handle, state = %update.state, "Dropping status update for unknown handle");
            }
        }
        Ok(())
    }

    /// Wake every job with outstanding work. Returns the number of jobs woken.
    pub fn sweep(&self) -> Result<usize> {
        let jobs: BTreeSet<Uuid> = self
            .shared
            .store
            .scan_desired_not_actual()?
            .into_iter()
            .map(|task| task.id.job_id)
            .collect();
        for job_id in &jobs {
            self.wake(*job_id);
        }
        Ok(jobs.len())
    }

    /// Periodic sweep. Runs until cancelled.
    pub async fn run_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.shared.config.reconcile_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep() {
                        Ok(0) => {}
                        Ok(jobs) => tracing::debug!(jobs, "Sweep found jobs to reconcile"),
                        Err(e) => tracing::warn!(error = %e, "Reconcile sweep failed"),
                    }
                }
            }
        }
    }

    /// Consume the master's status stream. Runs until cancelled.
    pub async fn run_status_ingestion(self: Arc<Self>) {
        let mut updates = subscribe_status_updates(
            self.shared.master.client(),
            self.shared.config.backoff,
            self.cancel.child_token(),
        );

        loop {
            let update = tokio::select! {
                _ = self.cancel.cancelled() => break,
                update = updates.next() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            if let Err(e) = self.deliver_status(update) {
                tracing::warn!(error = %e, "Failed to route status update");
            }
        }
    }

    pub fn active_workers(&self) -> usize {
        self.workers().len()
    }

    /// Stop all workers and wait for them to finish their current step.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let slots: Vec<WorkerSlot> = self.workers().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let _ = slot.handle.await;
        }
    }

    /// Stop all workers at their next await point and wait until they are
    /// gone. A worker may be running on another thread when this is called,
    /// so its abort only takes effect once it yields.
    pub async fn abort(&self) {
        self.cancel.cancel();
        let slots: Vec<WorkerSlot> = self.workers().drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            slot.handle.abort();
        }
        for slot in slots {
            join_aborted(slot.handle).await;
        }
    }

    fn send(&self, job_id: Uuid, event: WorkerEvent) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut workers = self.workers();
        let mut event = event;
        if let Some(slot) = workers.get(&job_id) {
            match slot.events.send(event) {
                Ok(()) => return,
                // Worker exited; start a new one below
                Err(mpsc::error::SendError(returned)) => event = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(event);
        let worker = JobWorker::new(job_id, self.shared.clone());
        let handle = tokio::spawn(worker.run(rx, self.cancel.child_token()));
        workers.insert(
            job_id,
            WorkerSlot {
                events: tx,
                handle,
            },
        );
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<Uuid, WorkerSlot>> {
        // A panic while holding this lock leaves the map consistent
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Wait for an aborted task. Cancellation is the expected outcome.
pub(crate) async fn join_aborted(handle: JoinHandle<()>) {
    match handle.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::warn!(error = %e, "Task panicked while aborting"),
    }
}
