use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Behaviour of the in-process resource master.
#[derive(Debug, Clone)]
pub struct SimulatedMasterConfig {
    /// Time an instance spends in LAUNCHING before it reports RUNNING
    pub launch_delay_ms: u64,
    /// Time an instance spends in KILLING before it reports KILLED
    pub kill_delay_ms: u64,
    /// Launches asking for more CPUs than this are rejected
    pub max_task_cpus: f64,
    /// Capacity of each status connection
    pub status_buffer: usize,
}

impl Default for SimulatedMasterConfig {
    fn default() -> Self {
        Self {
            launch_delay_ms: 200,
            kill_delay_ms: 200,
            max_task_cpus: 32.0,
            status_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobMgrConfig {
    /// Address of the HTTP goal-state API
    pub listen_addr: SocketAddr,
    /// SQLite database holding job and task records
    pub db_path: PathBuf,
    /// Period of the sweep that looks for tasks whose actual state differs from the goal
    pub reconcile_interval_ms: u64,
    /// Tasks stuck in LAUNCHING or KILLING longer than this are queried explicitly
    pub transient_timeout_ms: u64,
    /// Deadline for a single launch, kill or query call to the master
    pub master_call_timeout_ms: u64,
    /// Poll period of `wait_for_state`
    pub wait_poll_interval_ms: u64,
    /// Attempts at a versioned write before giving up on a conflict
    pub conflict_retries: u32,
    /// Retry policy for directives that found the master unavailable
    pub backoff: BackoffPolicy,
}

impl Default for JobMgrConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:5392"
                .parse()
                .expect("default listen address is valid"),
            db_path: PathBuf::from("jobmgr.db"),
            reconcile_interval_ms: 1_000,
            transient_timeout_ms: 30_000,
            master_call_timeout_ms: 5_000,
            wait_poll_interval_ms: 200,
            conflict_retries: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl JobMgrConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn transient_timeout(&self) -> Duration {
        Duration::from_millis(self.transient_timeout_ms)
    }

    pub fn master_call_timeout(&self) -> Duration {
        Duration::from_millis(self.master_call_timeout_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}
