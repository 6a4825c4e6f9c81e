use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{http, GoalStateApi};
use crate::config::JobMgrConfig;
use crate::error::Result;
use crate::master::{MasterClient, TimedMaster};
use crate::reconciler::{join_aborted, Reconciler};
use crate::recovery::{Recovery, RecoveryReport};
use crate::store::StateStore;

/// A running job manager: store, recovery, reconciler and goal-state API.
pub struct JobManager {
    config: JobMgrConfig,
    store: Arc<StateStore>,
    master: Arc<dyn MasterClient>,
    reconciler: Arc<Reconciler>,
    api: GoalStateApi,
    recovery: RecoveryReport,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl JobManager {
    /// Open the store at `config.db_path` and start.
    pub async fn start(config: JobMgrConfig, master: Arc<dyn MasterClient>) -> Result<Self> {
        let store = Arc::new(StateStore::open(&config.db_path)?);
        Self::start_with_store(config, store, master).await
    }

    /// Start on an already open store.
    ///
    /// This is the full startup sequence:
    /// 1. Resolves directives left unverified by a previous run
    /// 2. Spawns the reconcile sweep
    /// 3. Spawns status update ingestion
    /// 4. Wakes every job recovery found with outstanding work
    ///
    /// The returned manager owns the spawned tasks; they stop on
    /// [`shutdown`](Self::shutdown) or [`abort`](Self::abort).
    pub async fn start_with_store(
        config: JobMgrConfig,
        store: Arc<StateStore>,
        master: Arc<dyn MasterClient>,
    ) -> Result<Self> {
        let timed = TimedMaster::new(master.clone(), config.master_call_timeout());

        let recovery = Recovery::new(store.clone(), timed.clone(), config.conflict_retries)
            .run()
            .await?;

        let cancel = CancellationToken::new();
        let reconciler = Reconciler::new(store.clone(), timed, config.clone(), cancel.clone());

        let handles = vec![
            tokio::spawn(reconciler.clone().run_sweep()),
            tokio::spawn(reconciler.clone().run_status_ingestion()),
        ];

        for job_id in &recovery.jobs_with_work {
            reconciler.wake(*job_id);
        }

        let api = GoalStateApi::new(store.clone(), &config).with_reconciler(reconciler.clone());

        tracing::info!(
            db = ?store.path(),
            reconcile_interval_ms = config.reconcile_interval_ms,
            "Job manager started"
        );

        Ok(Self {
            config,
            store,
            master,
            reconciler,
            api,
            recovery,
            cancel,
            handles,
        })
    }

    pub fn api(&self) -> &GoalStateApi {
        &self.api
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn config(&self) -> &JobMgrConfig {
        &self.config
    }

    /// What startup recovery found.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Serve the HTTP API on `config.listen_addr` until `shutdown` fires.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        http::serve(self.config.listen_addr, self.api.clone(), shutdown).await
    }

    /// Stop gracefully: background loops exit and workers finish the step
    /// they are in.
    pub async fn shutdown(self) {
        tracing::info!("Job manager shutting down");
        self.cancel.cancel();
        self.reconciler.shutdown().await;
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("Job manager stopped");
    }

    /// Stop immediately, as a crash would. Directives in flight are left
    /// with their markers for the next start to verify.
    ///
    /// Returns once every background task has stopped, so nothing of this
    /// manager can reach the master after it.
    pub async fn abort(self) {
        self.cancel.cancel();
        for handle in &self.handles {
            handle.abort();
        }
        self.reconciler.abort().await;
        for handle in self.handles {
            join_aborted(handle).await;
        }
        tracing::warn!("Job manager aborted");
    }

    /// Abort and start again from what the store holds. A store with a path
    /// is reopened from disk.
    pub async fn restart(self) -> Result<Self> {
        let config = self.config.clone();
        let master = self.master.clone();
        let store = self.store.clone();
        self.abort().await;

        let store = match store.path() {
            Some(path) => Arc::new(StateStore::open(path)?),
            None => store,
        };
        Self::start_with_store(config, store, master).await
    }
}
