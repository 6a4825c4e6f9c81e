//! Resource master protocol.
//!
//! The job manager never runs tasks itself. It asks a resource master to
//! launch and kill task instances and learns about their runtime state from
//! the master's status updates and explicit queries.
//!
//! # Components
//!
//! - [`MasterClient`]: the protocol, implemented by adapters to a real master
//! - [`TimedMaster`]: wraps a client with a per-call deadline
//! - [`subscribe_status_updates`]: reconnecting status update stream
//! - [`SimulatedMaster`]: in-process master with a down/up switch
//!
//! # Failure model
//!
//! [`MasterError::Unavailable`] is transient and always retried. A call that
//! times out is reported as unavailable too, since the directive may or may
//! not have reached the master. [`MasterError::Rejected`] and
//! [`MasterError::UnknownHandle`] are final answers for that attempt.

pub mod simulated;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::job::{ResourceShape, TaskId, TaskState};

pub use simulated::SimulatedMaster;
pub use stream::subscribe_status_updates;

/// Opaque identifier of a task instance on the master.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterHandle(String);

impl MasterHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    #[error("master unavailable: {0}")]
    Unavailable(String),

    #[error("rejected by master: {0}")]
    Rejected(String),

    #[error("unknown handle: {0}")]
    UnknownHandle(MasterHandle),
}

impl MasterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MasterError::Unavailable(_))
    }
}

/// Everything the master needs to start one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub task_id: TaskId,
    /// Handle chosen by the job manager so that a launch can be found again
    /// by query when its outcome is unknown.
    pub handle: MasterHandle,
    pub command: String,
    pub resources: ResourceShape,
}

/// Runtime state change reported by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub handle: MasterHandle,
    pub state: TaskState,
    pub message: Option<String>,
}

#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Start a task instance. Launching a handle the master already knows
    /// returns that handle without starting a second instance.
    async fn launch(&self, request: LaunchRequest) -> Result<MasterHandle, MasterError>;

    /// Kill a task instance.
    async fn kill(&self, handle: &MasterHandle) -> Result<(), MasterError>;

    /// Current runtime state of a task instance.
    async fn query(&self, handle: &MasterHandle) -> Result<TaskState, MasterError>;

    /// Open a status update connection. The master closes it when it goes down.
    async fn connect_status(&self) -> Result<broadcast::Receiver<StatusUpdate>, MasterError>;
}

/// Master client with a deadline on every directive.
#[derive(Clone)]
pub struct TimedMaster {
    client: Arc<dyn MasterClient>,
    call_timeout: Duration,
}

impl TimedMaster {
    pub fn new(client: Arc<dyn MasterClient>, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    pub fn client(&self) -> Arc<dyn MasterClient> {
        self.client.clone()
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<MasterHandle, MasterError> {
        self.bounded("launch", self.client.launch(request)).await
    }

    pub async fn kill(&self, handle: &MasterHandle) -> Result<(), MasterError> {
        self.bounded("kill", self.client.kill(handle)).await
    }

    pub async fn query(&self, handle: &MasterHandle) -> Result<TaskState, MasterError> {
        self.bounded("query", self.client.query(handle)).await
    }

    async fn bounded<T>(
        &self,
        op: &str,
        call: impl std::future::Future<Output = Result<T, MasterError>>,
    ) -> Result<T, MasterError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MasterError::Unavailable(format!(
                "{} timed out after {}ms",
                op,
                self.call_timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hanging;

    #[async_trait]
    impl MasterClient for Hanging {
        async fn launch(&self, _request: LaunchRequest) -> Result<MasterHandle, MasterError> {
            std::future::pending().await
        }

        async fn kill(&self, _handle: &MasterHandle) -> Result<(), MasterError> {
            std::future::pending().await
        }

        async fn query(&self, handle: &MasterHandle) -> Result<TaskState, MasterError> {
            Err(MasterError::UnknownHandle(handle.clone()))
        }

        async fn connect_status(&self) -> Result<broadcast::Receiver<StatusUpdate>, MasterError> {
            Err(MasterError::Unavailable("no stream".into()))
        }
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(MasterError::Unavailable("down".into()).is_retryable());
        assert!(!MasterError::Rejected("too big".into()).is_retryable());
        assert!(!MasterError::UnknownHandle(MasterHandle::new("h")).is_retryable());
    }

    #[tokio::test]
    async fn timed_out_call_is_unavailable() {
        let master = TimedMaster::new(Arc::new(Hanging), Duration::from_millis(20));
        let err = master.kill(&MasterHandle::new("h")).await.unwrap_err();
        assert!(err.is_retryable());

        let err = master.query(&MasterHandle::new("h")).await.unwrap_err();
        assert_eq!(err, MasterError::UnknownHandle(MasterHandle::new("h")));
    }
}
