use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::SimulatedMasterConfig;
use crate::job::TaskState;
use crate::master::{LaunchRequest, MasterClient, MasterError, MasterHandle, StatusUpdate};

/// A directive the master accepted while it was up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Directive {
    Launch(MasterHandle),
    Kill(MasterHandle),
}

#[derive(Debug)]
struct SimTask {
    state: TaskState,
}

#[derive(Debug, Default)]
struct SimState {
    tasks: HashMap<MasterHandle, SimTask>,
    directives: Vec<Directive>,
}

struct Inner {
    config: SimulatedMasterConfig,
    up: AtomicBool,
    state: Mutex<SimState>,
    status_tx: Mutex<Option<broadcast::Sender<StatusUpdate>>>,
}

/// In-process resource master.
///
/// Tasks move LAUNCHING → RUNNING after `launch_delay` and KILLING → KILLED
/// after `kill_delay`. While stopped, every call fails with `Unavailable` and
/// is not recorded, open status connections are closed, and state changes on
/// the (simulated) agents keep happening without being reported.
#[derive(Clone)]
pub struct SimulatedMaster {
    inner: Arc<Inner>,
}

impl SimulatedMaster {
    pub fn new(config: SimulatedMasterConfig) -> Self {
        let (status_tx, _) = broadcast::channel(config.status_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                up: AtomicBool::new(true),
                state: Mutex::new(SimState::default()),
                status_tx: Mutex::new(Some(status_tx)),
            }),
        }
    }

    pub fn is_up(&self) -> bool {
        self.inner.up.load(Ordering::SeqCst)
    }

    /// Take the master down.
    pub fn stop(&self) {
        self.inner.up.store(false, Ordering::SeqCst);
        // Dropping the sender closes every open status connection
        lock(&self.inner.status_tx).take();
        tracing::info!("Simulated master stopped");
    }

    /// Bring the master back. Known tasks and handles are kept.
    pub fn start(&self) {
        let (status_tx, _) = broadcast::channel(self.inner.config.status_buffer.max(1));
        *lock(&self.inner.status_tx) = Some(status_tx);
        self.inner.up.store(true, Ordering::SeqCst);
        tracing::info!("Simulated master started");
    }

    /// Every directive accepted so far, in arrival order.
    pub fn directives(&self) -> Vec<Directive> {
        lock(&self.inner.state).directives.clone()
    }

    pub fn launch_count(&self, handle: &MasterHandle) -> usize {
        self.count(|d| matches!(d, Directive::Launch(h) if h == handle))
    }

    pub fn kill_count(&self, handle: &MasterHandle) -> usize {
        self.count(|d| matches!(d, Directive::Kill(h) if h == handle))
    }

    pub fn total_launches(&self) -> usize {
        self.count(|d| matches!(d, Directive::Launch(_)))
    }

    pub fn total_kills(&self) -> usize {
        self.count(|d| matches!(d, Directive::Kill(_)))
    }

    /// Launch directives received for any run of the job's tasks.
    pub fn launches_for_job(&self, job_id: Uuid) -> usize {
        let prefix = format!("{}-", job_id);
        self.count(|d| matches!(d, Directive::Launch(h) if h.as_str().starts_with(&prefix)))
    }

    /// Kill directives received for any run of the job's tasks.
    pub fn kills_for_job(&self, job_id: Uuid) -> usize {
        let prefix = format!("{}-", job_id);
        self.count(|d| matches!(d, Directive::Kill(h) if h.as_str().starts_with(&prefix)))
    }

    /// Runtime state of a task as the agents see it, regardless of whether
    /// the master is up.
    pub fn task_state(&self, handle: &MasterHandle) -> Option<TaskState> {
        lock(&self.inner.state).tasks.get(handle).map(|t| t.state)
    }

    /// Handles of instances currently launching or running.
    pub fn live_handles(&self) -> Vec<MasterHandle> {
        let mut handles: Vec<MasterHandle> = lock(&self.inner.state)
            .tasks
            .iter()
            .filter(|(_, t)| t.state.is_live())
            .map(|(h, _)| h.clone())
            .collect();
        handles.sort();
        handles
    }

    /// Simulate the loss of an instance (e.g. its agent disappeared).
    pub fn fail_task(&self, handle: &MasterHandle, state: TaskState) -> bool {
        let changed = {
            let mut sim = lock(&self.inner.state);
            match sim.tasks.get_mut(handle) {
                Some(task) if !task.state.is_terminal() => {
                    task.state = state;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.inner.emit(handle, state, Some("simulated failure".to_string()));
        }
        changed
    }

    fn count(&self, pred: impl Fn(&Directive) -> bool) -> usize {
        lock(&self.inner.state)
            .directives
            .iter()
            .filter(|d| pred(d))
            .count()
    }

    fn ensure_up(&self) -> Result<(), MasterError> {
        if self.is_up() {
            Ok(())
        } else {
            Err(MasterError::Unavailable("master is down".into()))
        }
    }

    /// Move `handle` from `from` to `to` after `delay`, if it is still in `from`.
    fn schedule_transition(&self, handle: MasterHandle, from: TaskState, to: TaskState, delay: Duration) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let moved = {
                let mut sim = lock(&inner.state);
                match sim.tasks.get_mut(&handle) {
                    Some(task) if task.state == from => {
                        task.state = to;
                        true
                    }
                    _ => false,
                }
            };
            if moved {
                inner.emit(&handle, to, None);
            }
        });
    }
}

impl Inner {
    fn emit(&self, handle: &MasterHandle, state: TaskState, message: Option<String>) {
        if !self.up.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = lock(&self.status_tx).as_ref() {
            // No subscribers is fine
            let _ = tx.send(StatusUpdate {
                handle: handle.clone(),
                state,
                message,
            });
        }
    }
}

#[async_trait]
impl MasterClient for SimulatedMaster {
    async fn launch(&self, request: LaunchRequest) -> Result<MasterHandle, MasterError> {
        self.ensure_up()?;

        if request.resources.cpus > self.inner.config.max_task_cpus {
            return Err(MasterError::Rejected(format!(
                "task asks for {} cpus, offers hold at most {}",
                request.resources.cpus, self.inner.config.max_task_cpus
            )));
        }

        let handle = request.handle;
        let started = {
            let mut sim = lock(&self.inner.state);
            sim.directives.push(Directive::Launch(handle.clone()));
            if sim.tasks.contains_key(&handle) {
                false
            } else {
                sim.tasks.insert(
                    handle.clone(),
                    SimTask {
                        state: TaskState::Launching,
                    },
                );
                true
            }
        };

        if started {
            tracing::debug!(handle = %handle, task_id = %request.task_id, "Launching task");
            self.inner.emit(&handle, TaskState::Launching, None);
            self.schedule_transition(
                handle.clone(),
                TaskState::Launching,
                TaskState::Running,
                Duration::from_millis(self.inner.config.launch_delay_ms),
            );
        }
        Ok(handle)
    }

    async fn kill(&self, handle: &MasterHandle) -> Result<(), MasterError> {
        self.ensure_up()?;

        let killing = {
            let mut sim = lock(&self.inner.state);
            if !sim.tasks.contains_key(handle) {
                return Err(MasterError::UnknownHandle(handle.clone()));
            }
            sim.directives.push(Directive::Kill(handle.clone()));
            match sim.tasks.get_mut(handle) {
                Some(task) if task.state.is_live() => {
                    task.state = TaskState::Killing;
                    true
                }
                _ => false,
            }
        };

        if killing {
            tracing::debug!(handle = %handle, "Killing task");
            self.inner.emit(handle, TaskState::Killing, None);
            self.schedule_transition(
                handle.clone(),
                TaskState::Killing,
                TaskState::Killed,
                Duration::from_millis(self.inner.config.kill_delay_ms),
            );
        }
        Ok(())
    }

    async fn query(&self, handle: &MasterHandle) -> Result<TaskState, MasterError> {
        self.ensure_up()?;
        self.task_state(handle)
            .ok_or_else(|| MasterError::UnknownHandle(handle.clone()))
    }

    async fn connect_status(&self) -> Result<broadcast::Receiver<StatusUpdate>, MasterError> {
        self.ensure_up()?;
        lock(&self.inner.status_tx)
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| MasterError::Unavailable("status stream closed".into()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves the simulation usable
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
