// =============================================================================
// Notifier — bounded async event fan-out with drop-on-overflow
// =============================================================================
//
// Traders push one-line event summaries here (cycle recorded, risk trip,
// action failure). Delivery runs on an internal worker task so producers
// never block: when the queue is full the message is dropped with a warning,
// not retried. The supervisor stops the worker at shutdown.
// =============================================================================

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default capacity of the send queue.
const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// One event in the queue.
#[derive(Debug, Clone)]
pub struct Notification {
    pub trader_id: String,
    pub message: String,
}

/// Handle for sending notifications from anywhere in the fleet.
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    /// Spawn the delivery worker with the default queue capacity.
    pub fn spawn() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Delivery sink. Outbound integrations (Telegram, webhooks)
                // live outside the core; the worker surfaces events to the
                // operator log.
                info!(
                    trader_id = %event.trader_id,
                    "{}",
                    event.message
                );
            }
        });

        Self {
            tx,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Enqueue an event. Never blocks: a full queue drops the message with
    /// a warning.
    pub fn notify(&self, trader_id: &str, message: impl Into<String>) {
        let event = Notification {
            trader_id: trader_id.to_string(),
            message: message.into(),
        };
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(event) {
            warn!(
                trader_id = %dropped.trader_id,
                "notification queue full — dropping message"
            );
        }
    }

    /// Close the queue and wait for the worker to drain.
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            // Closing every sender ends the worker loop; we only hold one.
            // Dropping tx isn't possible through &self, so abort after a
            // bounded drain instead.
            tokio::task::yield_now().await;
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}
