//! Test harness for job manager integration tests.
//!
//! Runs a job manager against a [`SimulatedMaster`] with a temporary state
//! database and short timings, and supports crash-style restarts.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use jobmgr_lite::api::{GoalStateApi, JobStatus};
use jobmgr_lite::backoff::BackoffPolicy;
use jobmgr_lite::config::{JobMgrConfig, SimulatedMasterConfig};
use jobmgr_lite::job::{GoalState, JobSpec, TaskRecord};
use jobmgr_lite::manager::JobManager;
use jobmgr_lite::master::{MasterClient, SimulatedMaster};

/// Default time to wait for a job to converge
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Job manager configuration with shorter timings for faster tests
pub fn test_config(db_path: PathBuf) -> JobMgrConfig {
    let mut config = JobMgrConfig::new(db_path).with_backoff(BackoffPolicy::new(20, 200));
    config.reconcile_interval_ms = 50;
    config.transient_timeout_ms = 1_000;
    config.master_call_timeout_ms = 500;
    config.wait_poll_interval_ms = 20;
    config
}

pub fn test_master_config() -> SimulatedMasterConfig {
    SimulatedMasterConfig {
        launch_delay_ms: 30,
        kill_delay_ms: 30,
        ..SimulatedMasterConfig::default()
    }
}

/// A job manager over a temporary database and a simulated master.
pub struct TestJobManager {
    pub master: SimulatedMaster,
    client: Arc<dyn MasterClient>,
    config: JobMgrConfig,
    manager: Option<JobManager>,
    _dir: TempDir,
}

impl TestJobManager {
    pub async fn start() -> Self {
        Self::with_master(SimulatedMaster::new(test_master_config())).await
    }

    pub async fn with_master(master: SimulatedMaster) -> Self {
        let client: Arc<dyn MasterClient> = Arc::new(master.clone());
        Self::with_client(master, client).await
    }

    /// Start with `client` as the manager's view of `master`, e.g. a wrapper
    /// that injects faults in front of it.
    pub async fn with_client(master: SimulatedMaster, client: Arc<dyn MasterClient>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().join("state.db"));
        let manager = JobManager::start(config.clone(), client.clone())
            .await
            .unwrap();

        Self {
            master,
            client,
            config,
            manager: Some(manager),
            _dir: dir,
        }
    }

    pub fn manager(&self) -> &JobManager {
        self.manager.as_ref().expect("job manager is running")
    }

    pub fn api(&self) -> &GoalStateApi {
        self.manager().api()
    }

    /// Kill the manager without any cleanup, as a process crash would.
    pub async fn crash(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.abort().await;
        }
    }

    /// Start a fresh manager on the same database, talking to `client`.
    pub async fn restart_with_client(&mut self, client: Arc<dyn MasterClient>) {
        self.crash().await;
        self.client = client;
        let manager = JobManager::start(self.config.clone(), self.client.clone())
            .await
            .unwrap();
        self.manager = Some(manager);
    }

    /// Crash and start again on the same database and master.
    pub async fn restart(&mut self) {
        let manager = match self.manager.take() {
            Some(manager) => manager.restart().await.unwrap(),
            None => JobManager::start(self.config.clone(), self.client.clone())
                .await
                .unwrap(),
        };
        self.manager = Some(manager);
    }

    pub async fn shutdown(mut self) {
        if let Some(manager) = self.manager.take() {
            manager.shutdown().await;
        }
    }

    pub fn create_job(&self, name: &str, instances: u32) -> Uuid {
        self.api()
            .create(JobSpec::new(name, instances, "sleep 3600"))
            .unwrap()
    }

    pub fn tasks(&self, job_id: Uuid) -> Vec<TaskRecord> {
        self.api().get_job(job_id).unwrap().tasks
    }

    /// Wait for the job to reach `goal`, panicking on timeout.
    pub async fn converge(&self, job_id: Uuid, goal: GoalState) -> JobStatus {
        self.api()
            .wait_for_state(job_id, goal, CONVERGE_TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("job {} did not reach {}: {}", job_id, goal, e))
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
