//! In-process uplink queue
//!
//! The webhook pushes serialized uplink records; the worker pulls them,
//! runs them through an [`UplinkHandler`] with bounded concurrency and
//! redelivers failures until the attempt budget is spent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{ConnectorError, Result};
use crate::uplink::{UplinkPayload, UplinkProcessor};

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: Bytes,
    /// Deliveries so far
    pub dequeue_count: u32,
}

/// Producer side of the named uplink queue
#[derive(Clone)]
pub struct UplinkQueue {
    name: Arc<str>,
    sender: mpsc::Sender<QueueMessage>,
}

impl UplinkQueue {
    pub fn new(name: &str, capacity: usize) -> (Self, mpsc::Receiver<QueueMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: Arc::from(name),
                sender,
            },
            receiver,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a new message without waiting for capacity.
    pub fn enqueue(&self, body: impl Into<Bytes>) -> Result<()> {
        let message = QueueMessage {
            body: body.into(),
            dequeue_count: 0,
        };
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => ConnectorError::Queue(format!("queue {} is full", self.name)),
            TrySendError::Closed(_) => {
                ConnectorError::Queue(format!("queue {} is closed", self.name))
            }
        })
    }
}

#[async_trait]
pub trait UplinkHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &UplinkPayload) -> Result<()>;
}

#[async_trait]
impl UplinkHandler for UplinkProcessor {
    async fn handle(&self, payload: &UplinkPayload) -> Result<()> {
        self.process(payload).await
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    delay_max: Duration,
}

impl RetryPolicy {
    fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
            delay_max: Duration::from_millis(config.retry_delay_max_ms),
        }
    }

    /// Backoff before the redelivery that follows `attempts` failed deliveries.
    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempts.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor).min(self.delay_max)
    }
}

pub struct UplinkQueueWorker<H> {
    queue: UplinkQueue,
    receiver: mpsc::Receiver<QueueMessage>,
    retry_sender: mpsc::UnboundedSender<QueueMessage>,
    retries: mpsc::UnboundedReceiver<QueueMessage>,
    handler: Arc<H>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl<H: UplinkHandler> UplinkQueueWorker<H> {
    pub fn new(
        queue: UplinkQueue,
        receiver: mpsc::Receiver<QueueMessage>,
        handler: Arc<H>,
        config: &QueueConfig,
    ) -> Self {
        let (retry_sender, retries) = mpsc::unbounded_channel();
        Self {
            queue,
            receiver,
            retry_sender,
            retries,
            handler,
            policy: RetryPolicy::from_config(config),
            concurrency: config.concurrency.max(1),
        }
    }

    /// Consume until cancelled, then wait for in-flight messages.
    ///
    /// A message is only taken once a slot is free, so a full queue pushes
    /// back on the webhook. Failed messages give their slot up before the
    /// backoff and come back through the retry lane.
    pub async fn run(mut self, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        info!(
            "Uplink worker listening on queue {} ({} concurrent)",
            self.queue.name(),
            self.concurrency
        );

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(message) = self.retries.recv() => message,
                message = self.receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let queue = self.queue.clone();
            let handler = Arc::clone(&self.handler);
            let retry_sender = self.retry_sender.clone();
            let policy = self.policy;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let retry = deliver(&queue, handler.as_ref(), policy.max_attempts, message).await;
                drop(permit);

                let Some(retry) = retry else {
                    return;
                };
                let delay = policy.backoff(retry.dequeue_count);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(
                            "Uplink retry on queue {} dropped at shutdown after {} attempts",
                            queue.name(),
                            retry.dequeue_count
                        );
                    }
                    _ = tokio::time::sleep(delay) => {
                        if retry_sender.send(retry).is_err() {
                            error!("Uplink retry lost, worker on queue {} is gone", queue.name());
                        }
                    }
                }
            });
        }

        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        info!("Uplink worker on queue {} stopped", self.queue.name());
    }
}

/// Hand one message to the handler. Returns the message to redeliver when
/// the attempt failed and the budget allows another.
async fn deliver<H: UplinkHandler>(
    queue: &UplinkQueue,
    handler: &H,
    max_attempts: u32,
    message: QueueMessage,
) -> Option<QueueMessage> {
    let dequeue_count = message.dequeue_count + 1;

    let payload: UplinkPayload = match serde_json::from_slice(&message.body) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Dropping unreadable message from queue {}: {}", queue.name(), e);
            return None;
        }
    };

    match handler.handle(&payload).await {
        Ok(()) => {
            debug!(packet_id = payload.packet_id, dequeue_count, "Uplink delivered");
            None
        }
        Err(e) if dequeue_count >= max_attempts => {
            error!(
                packet_id = payload.packet_id,
                device_id = payload.device_id,
                application_id = payload.user_application_id,
                "Uplink poisoned after {} attempts: {}",
                dequeue_count,
                e
            );
            None
        }
        Err(e) => {
            warn!(
                packet_id = payload.packet_id,
                device_id = payload.device_id,
                application_id = payload.user_application_id,
                "Uplink attempt {} failed, redelivering: {}",
                dequeue_count,
                e
            );
            Some(QueueMessage {
                body: message.body,
                dequeue_count,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Fails the first `failures` deliveries of every packet
    #[derive(Default)]
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
        handled: Mutex<Vec<u64>>,
        attempted_at: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl UplinkHandler for FlakyHandler {
        async fn handle(&self, payload: &UplinkPayload) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.attempted_at.lock().unwrap().push(Instant::now());
            if call <= self.failures {
                return Err(ConnectorError::Transport("hub unavailable".into()));
            }
            self.handled.lock().unwrap().push(payload.packet_id);
            Ok(())
        }
    }

    fn record(packet_id: u64) -> Bytes {
        let payload = UplinkPayload {
            packet_id,
            device_type: 1,
            device_id: 42,
            user_application_id: 10,
            organization_id: 65432,
            data: String::new(),
            length: 0,
            status: 0,
            swarm_hive_received_at_utc: Utc::now(),
            uplink_web_hook_received_at_utc: Utc::now(),
            client: "test".to_string(),
        };
        Bytes::from(serde_json::to_vec(&payload).unwrap())
    }

    fn quick_retries(max_attempts: u32, concurrency: usize) -> QueueConfig {
        QueueConfig {
            max_attempts,
            concurrency,
            retry_delay_ms: 1,
            retry_delay_max_ms: 4,
        }
    }

    fn start(handler: Arc<FlakyHandler>, max_attempts: u32) -> (UplinkQueue, CancellationToken) {
        start_with(handler, 16, &quick_retries(max_attempts, 4))
    }

    fn start_with(
        handler: Arc<FlakyHandler>,
        capacity: usize,
        config: &QueueConfig,
    ) -> (UplinkQueue, CancellationToken) {
        let (queue, receiver) = UplinkQueue::new("uplink", capacity);
        let worker = UplinkQueueWorker::new(queue.clone(), receiver, handler, config);
        let cancel = CancellationToken::new();
        tokio::spawn(worker.run(cancel.clone()));
        (queue, cancel)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_message_is_handled() {
        let handler = Arc::new(FlakyHandler::default());
        let (queue, cancel) = start(Arc::clone(&handler), 5);

        queue.enqueue(record(1)).unwrap();
        queue.enqueue(record(2)).unwrap();
        settle().await;

        let mut handled = handler.handled.lock().unwrap().clone();
        handled.sort();
        assert_eq!(handled, vec![1, 2]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failure_is_redelivered() {
        let handler = Arc::new(FlakyHandler {
            failures: 2,
            ..Default::default()
        });
        let (queue, cancel) = start(Arc::clone(&handler), 5);

        queue.enqueue(record(7)).unwrap();
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*handler.handled.lock().unwrap(), vec![7]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let handler = Arc::new(FlakyHandler {
            failures: u32::MAX,
            ..Default::default()
        });
        let (queue, cancel) = start(Arc::clone(&handler), 3);

        queue.enqueue(record(9)).unwrap();
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(handler.handled.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unreadable_message_is_dropped() {
        let handler = Arc::new(FlakyHandler::default());
        let (queue, cancel) = start(Arc::clone(&handler), 5);

        queue.enqueue("not json").unwrap();
        queue.enqueue(record(3)).unwrap();
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.handled.lock().unwrap(), vec![3]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_backs_off() {
        let handler = Arc::new(FlakyHandler {
            failures: u32::MAX,
            ..Default::default()
        });
        let config = QueueConfig {
            max_attempts: 4,
            concurrency: 4,
            retry_delay_ms: 1_000,
            retry_delay_max_ms: 3_000,
        };
        let (queue, cancel) = start_with(Arc::clone(&handler), 16, &config);

        queue.enqueue(record(5)).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let attempted_at = handler.attempted_at.lock().unwrap().clone();
        assert_eq!(attempted_at.len(), 4);
        let gaps: Vec<Duration> = attempted_at.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, expected) in gaps.iter().zip([1, 2, 3]) {
            assert!(*gap >= Duration::from_secs(expected), "gap {:?}", gap);
            assert!(*gap < Duration::from_secs(expected + 1), "gap {:?}", gap);
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_keep_flowing_when_queue_is_full() {
        let handler = Arc::new(FlakyHandler {
            failures: u32::MAX,
            ..Default::default()
        });
        let config = QueueConfig {
            max_attempts: 5,
            concurrency: 1,
            retry_delay_ms: 10,
            retry_delay_max_ms: 50,
        };
        let (queue, cancel) = start_with(Arc::clone(&handler), 2, &config);

        let mut accepted = 0;
        for packet_id in 0..100 {
            if queue.enqueue(record(packet_id)).is_ok() {
                accepted += 1;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(accepted > 2, "only {} accepted", accepted);
        assert_eq!(handler.calls.load(Ordering::SeqCst), accepted * 5);
        queue.enqueue(record(100)).unwrap();
        cancel.cancel();
    }

    #[test]
    fn test_backoff_doubles_up_to_maximum() {
        let policy = RetryPolicy::from_config(&QueueConfig {
            retry_delay_ms: 500,
            retry_delay_max_ms: 3_000,
            ..Default::default()
        });
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(4), Duration::from_millis(3_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3_000));
    }

    #[test]
    fn test_full_queue_rejects_enqueue() {
        let (queue, _receiver) = UplinkQueue::new("uplink", 1);
        queue.enqueue(record(1)).unwrap();
        assert!(matches!(queue.enqueue(record(2)), Err(ConnectorError::Queue(_))));
    }

    #[test]
    fn test_closed_queue_rejects_enqueue() {
        let (queue, receiver) = UplinkQueue::new("uplink", 4);
        drop(receiver);
        assert!(matches!(queue.enqueue(record(1)), Err(ConnectorError::Queue(_))));
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let (queue, receiver) = UplinkQueue::new("uplink", 4);
        let worker = UplinkQueueWorker::new(
            queue,
            receiver,
            Arc::new(FlakyHandler::default()),
            &QueueConfig::default(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
