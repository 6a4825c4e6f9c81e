use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::master::{MasterClient, StatusUpdate};

const STATUS_BUFFER: usize = 1024;

/// Subscribe to the master's status updates.
///
/// The returned stream never ends on its own: when the master drops the
/// connection the pump reconnects with backoff. Updates emitted while
/// disconnected are lost, so consumers must not treat the stream as the only
/// source of truth. The pump exits when `cancel` fires or the stream is dropped.
pub fn subscribe_status_updates(
    client: Arc<dyn MasterClient>,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
) -> ReceiverStream<StatusUpdate> {
    let (tx, rx) = mpsc::channel(STATUS_BUFFER);

    tokio::spawn(async move {
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                result = client.connect_status() => result,
            };

            let mut updates = match connected {
                Ok(updates) => {
                    if attempt > 0 {
                        tracing::info!(attempts = attempt, "Reconnected to master status stream");
                    }
                    attempt = 0;
                    updates
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff.delay(attempt);
                    tracing::debug!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Status stream connect failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = updates.recv() => received,
                };

                match received {
                    Ok(update) => {
                        if tx.send(update).await.is_err() {
                            // Subscriber dropped
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Status stream lagged, updates dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Master closed status stream, reconnecting");
                        attempt = 1;
                        break;
                    }
                }
            }
        }
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatedMasterConfig;
    use crate::job::{ResourceShape, TaskId, TaskState};
    use crate::master::{LaunchRequest, SimulatedMaster};
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    fn request(instance: u32) -> LaunchRequest {
        let task_id = TaskId::new(Uuid::new_v4(), instance);
        LaunchRequest {
            task_id,
            handle: task_id.handle_for_run(1),
            command: "sleep 1000".into(),
            resources: ResourceShape::default(),
        }
    }

    #[tokio::test]
    async fn stream_survives_master_outage() {
        let master = SimulatedMaster::new(SimulatedMasterConfig {
            launch_delay_ms: 10,
            kill_delay_ms: 10,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let mut stream = subscribe_status_updates(
            Arc::new(master.clone()),
            BackoffPolicy::new(10, 50),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = master.launch(request(0)).await.unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.handle, first);

        master.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        master.start();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = master.launch(request(1)).await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(update) = stream.next().await {
                if update.handle == second && update.state == TaskState::Running {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(seen, "updates after reconnect should be delivered");

        cancel.cancel();
    }
}
