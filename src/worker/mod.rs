//! Inbound side: turn each request into a correlated response.
//!
//! The worker reads requests in batches from the inbound queue, runs the
//! [`Processor`] on each, and publishes a [`ResponseEnvelope`] carrying the
//! request's identity plus timing and delivery metadata to the outbound
//! queue. A request is acknowledged (deleted) only after its response was
//! published; any failure leaves it leased, to be redelivered when the
//! lease lapses. The worker never retries by itself.

mod processor;

pub use processor::{PassThrough, Processor};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{
    // ---
    clock,
    log_debug,
    log_error,
    log_info,
    log_warn,
    Delivery,
    QueuePtr,
    ReceiptHandle,
    ReceiveOptions,
    RelayConfig,
    RequestEnvelope,
    ResponseEnvelope,
    Result,
    RpcError,
};

/// Largest batch taken from the inbound queue in one read.
pub const MAX_BATCH: usize = 10;

/// Lease taken on inbound requests while they are processed.
const INBOUND_LEASE: Duration = Duration::from_secs(30);

/// Pause after a failed read of the inbound queue.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// One request of a batch that was not answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemFailure {
    /// Queue-assigned id of the failed message.
    pub message_id: Arc<str>,

    pub error: String,
}

/// Result of handling a batch: what to acknowledge and what failed.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Receipts of requests whose response was published.
    pub acknowledged: Vec<ReceiptHandle>,

    pub failures: Vec<BatchItemFailure>,
}

/// Answers requests from the inbound queue.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<RelayConfig>,
    replies: QueuePtr,
    processor: Arc<dyn Processor>,
}

/// Handle to a worker loop started with [`Worker::spawn`].
pub struct WorkerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Stop the loop after the batch in progress and wait for it.
    pub async fn shutdown(mut self) -> Result<()> {
        // ---
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join
            .await
            .map_err(|e| RpcError::Transport(format!("worker task failed: {e}")))?
    }
}

impl Worker {
    // ---
    /// Create a worker publishing responses to `replies`, doing no work of
    /// its own per request.
    pub fn new(config: Arc<RelayConfig>, replies: QueuePtr) -> Self {
        Self::with_processor(config, replies, Arc::new(PassThrough))
    }

    /// Create a worker running `processor` on every request.
    pub fn with_processor(
        config: Arc<RelayConfig>,
        replies: QueuePtr,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                replies,
                processor,
            }),
        }
    }

    /// Answer one request.
    ///
    /// Returns the response as published, with `callback_send_end_unix_nano`
    /// filled in afterwards.
    ///
    /// # Errors
    ///
    /// - [`RpcError::InvalidInput`]: the body is not a request or lacks `id`
    ///   or `runId`
    /// - [`RpcError::Publish`]: the response could not be sent
    /// - whatever the processor returns
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<ResponseEnvelope> {
        // ---
        let inner = &self.inner;

        let request = RequestEnvelope::from_json(&delivery.body)
            .map_err(|e| RpcError::InvalidInput(format!("unmarshal message body: {e}")))?;
        if request.id.trim().is_empty() {
            return Err(RpcError::InvalidInput("missing id in message body".into()));
        }
        if request.run_id.trim().is_empty() {
            return Err(RpcError::InvalidInput("missing runId in message body".into()));
        }

        let worker_receive_unix_nano = clock::unix_nanos();
        inner.processor.process(&request).await?;
        let worker_done_unix_nano = clock::unix_nanos();

        let mut response = ResponseEnvelope {
            id: request.id,
            run_id: request.run_id,
            region: inner.config.region.clone(),
            push_queue_name: delivery.source_queue.to_string(),
            receive_queue_name: inner.replies.name().to_string(),
            send_unix_nano: request.send_unix_nano,
            send_start_unix_nano: request.send_start_unix_nano,
            worker_receive_unix_nano,
            worker_done_unix_nano,
            callback_send_start_unix_nano: clock::unix_nanos(),
            callback_send_end_unix_nano: 0,
            sqs_sent_timestamp_ms: delivery.attributes.sent_timestamp_ms,
            sqs_first_receive_timestamp_ms: delivery.attributes.first_receive_timestamp_ms,
            sqs_approx_receive_count: delivery.attributes.receive_count,
        };

        let body = serde_json::to_string(&response)?;
        inner
            .replies
            .send(body, Duration::ZERO)
            .await
            .map_err(|e| RpcError::Publish(e.to_string()))?;
        response.callback_send_end_unix_nano = clock::unix_nanos();

        log_info!(
            "answered {} (run {}) from {} after {} receive(s)",
            response.id,
            response.run_id,
            response.push_queue_name,
            response.sqs_approx_receive_count
        );
        Ok(response)
    }

    /// Answer every request of a batch independently.
    ///
    /// One failed request does not affect the others.
    pub async fn handle_batch(&self, deliveries: &[Delivery]) -> BatchOutcome {
        // ---
        let mut outcome = BatchOutcome::default();

        for delivery in deliveries {
            match self.handle_delivery(delivery).await {
                Ok(_) => outcome.acknowledged.push(delivery.receipt.clone()),
                Err(err) => {
                    log_warn!("request {} failed: {err}", delivery.message_id);
                    outcome.failures.push(BatchItemFailure {
                        message_id: delivery.message_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        outcome
    }

    /// Read and answer requests from `inbound` until `shutdown` resolves or
    /// the queue is closed.
    ///
    /// A failed read is logged and retried after a short pause; it never
    /// ends the loop.
    pub async fn run<S>(&self, inbound: QueuePtr, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        // ---
        let options = ReceiveOptions {
            max_messages: MAX_BATCH,
            wait_time: self.inner.config.poll.wait_time,
            visibility_timeout: INBOUND_LEASE,
        };
        tokio::pin!(shutdown);

        log_debug!("worker started on {}", inbound.name());

        loop {
            let batch = tokio::select! {
                _ = &mut shutdown => break,
                batch = inbound.receive(options) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(RpcError::Closed(_)) => {
                    log_debug!("{}: queue closed", inbound.name());
                    break;
                }
                Err(e) => {
                    log_error!("{}: receive failed: {e}", inbound.name());
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };
            if batch.is_empty() {
                continue;
            }

            let outcome = self.handle_batch(&batch).await;
            for receipt in &outcome.acknowledged {
                if let Err(e) = inbound.delete(receipt).await {
                    log_warn!("{}: failed to acknowledge {}: {e}", inbound.name(), receipt.0);
                }
            }
        }

        log_debug!("worker stopped on {}", inbound.name());
        Ok(())
    }

    /// Run the worker loop on a background task.
    pub fn spawn(&self, inbound: QueuePtr) -> WorkerHandle {
        // ---
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let worker = self.clone();

        let join = tokio::spawn(async move {
            worker
                .run(inbound, async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        WorkerHandle {
            shutdown_tx: Some(shutdown_tx),
            join,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        create_memory_queue_with_broker, DeliveryAttributes, MemoryBroker, Queue, QueueBase,
        QueueConfig,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Inbound queue whose first read fails.
    struct FailsOnce {
        inner: QueuePtr,
        failed: AtomicBool,
    }

    #[async_trait]
    impl Queue for FailsOnce {
        fn base(&self) -> &QueueBase {
            self.inner.base()
        }

        async fn send(&self, body: String, delay: Duration) -> Result<Arc<str>> {
            self.inner.send(body, delay).await
        }

        async fn receive(&self, options: ReceiveOptions) -> Result<Vec<Delivery>> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(RpcError::Transport("connection reset".into()));
            }
            self.inner.receive(options).await
        }

        async fn delete(&self, receipt: &ReceiptHandle) -> Result<()> {
            self.inner.delete(receipt).await
        }

        async fn change_visibility(&self, receipt: &ReceiptHandle, timeout: Duration) -> Result<()> {
            self.inner.change_visibility(receipt, timeout).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    async fn open(broker: &Arc<MemoryBroker>, name: &str) -> QueuePtr {
        create_memory_queue_with_broker(QueueConfig::new("memory://", name), broker.clone())
            .await
            .unwrap()
    }

    fn delivery(id: &str, body: &str) -> Delivery {
        Delivery {
            message_id: id.into(),
            body: body.to_string(),
            receipt: format!("{id}#1").into(),
            attributes: DeliveryAttributes {
                sent_timestamp_ms: 1_000,
                first_receive_timestamp_ms: 1_005,
                receive_count: 3,
            },
            source_queue: "push".into(),
        }
    }

    struct Refuse;

    #[async_trait]
    impl Processor for Refuse {
        async fn process(&self, request: &RequestEnvelope) -> Result<()> {
            Err(RpcError::InvalidInput(format!("refused {}", request.id)))
        }
    }

    #[tokio::test]
    async fn response_echoes_identity_and_metadata() {
        // ---
        let broker = MemoryBroker::new();
        let replies = open(&broker, "replies").await;
        let config = Arc::new(RelayConfig::new("memory://push", "memory://replies").with_region("r"));
        let worker = Worker::new(config, replies.clone());

        let resp = worker
            .handle_delivery(&delivery(
                "m1",
                r#"{"id":"abc","runId":"run-1","sendUnixNano":7,"sendStartUnixNano":8}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.id, "abc");
        assert_eq!(resp.run_id, "run-1");
        assert_eq!(resp.region, "r");
        assert_eq!(resp.push_queue_name, "push");
        assert_eq!(resp.receive_queue_name, "replies");
        assert_eq!(resp.send_unix_nano, 7);
        assert_eq!(resp.send_start_unix_nano, 8);
        assert_eq!(resp.sqs_sent_timestamp_ms, 1_000);
        assert_eq!(resp.sqs_first_receive_timestamp_ms, 1_005);
        assert_eq!(resp.sqs_approx_receive_count, 3);
        assert!(resp.worker_done_unix_nano >= resp.worker_receive_unix_nano);
        assert!(resp.callback_send_end_unix_nano >= resp.callback_send_start_unix_nano);
        assert_eq!(broker.message_count("replies"), 1);
    }

    #[tokio::test]
    async fn bad_requests_fail_without_response() {
        // ---
        let broker = MemoryBroker::new();
        let replies = open(&broker, "replies").await;
        let worker = Worker::new(Arc::new(RelayConfig::new("a", "b")), replies);

        for body in ["nope", r#"{"runId":"r"}"#, r#"{"id":"x","runId":"  "}"#] {
            let err = worker.handle_delivery(&delivery("m", body)).await.unwrap_err();
            assert!(matches!(err, RpcError::InvalidInput(_)), "{body}: {err}");
        }
        assert_eq!(broker.message_count("replies"), 0);
    }

    #[tokio::test]
    async fn batch_failures_are_isolated() {
        // ---
        let broker = MemoryBroker::new();
        let replies = open(&broker, "replies").await;
        let worker = Worker::new(Arc::new(RelayConfig::new("a", "b")), replies);

        let outcome = worker
            .handle_batch(&[
                delivery("m1", r#"{"id":"a","runId":"r"}"#),
                delivery("m2", "garbage"),
                delivery("m3", r#"{"id":"c","runId":"r"}"#),
            ])
            .await;

        assert_eq!(outcome.acknowledged.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(&*outcome.failures[0].message_id, "m2");
        assert_eq!(broker.message_count("replies"), 2);
    }

    #[tokio::test]
    async fn processor_error_fails_the_request() {
        // ---
        let broker = MemoryBroker::new();
        let replies = open(&broker, "replies").await;
        let worker = Worker::with_processor(
            Arc::new(RelayConfig::new("a", "b")),
            replies,
            Arc::new(Refuse),
        );

        let outcome = worker
            .handle_batch(&[delivery("m1", r#"{"id":"a","runId":"r"}"#)])
            .await;
        assert!(outcome.acknowledged.is_empty());
        assert!(outcome.failures[0].error.contains("refused a"));
        assert_eq!(broker.message_count("replies"), 0);
    }

    #[tokio::test]
    async fn loop_acknowledges_only_answered_requests() {
        // ---
        let broker = MemoryBroker::new();
        let push = open(&broker, "push").await;
        let replies = open(&broker, "replies").await;
        let config = Arc::new(RelayConfig::new("a", "b").with_poll(crate::PollConfig {
            wait_time: Duration::from_millis(20),
            ..crate::PollConfig::default()
        }));
        let worker = Worker::new(config, replies);

        push.send(r#"{"id":"a","runId":"r"}"#.into(), Duration::ZERO)
            .await
            .unwrap();
        push.send("garbage".into(), Duration::ZERO).await.unwrap();

        let handle = worker.spawn(push.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.message_count("replies"), 1);
        // The bad request is still there, leased until its lease lapses.
        assert_eq!(broker.message_count("push"), 1);
    }

    #[tokio::test]
    async fn loop_survives_a_failed_read() {
        // ---
        let broker = MemoryBroker::new();
        let push = open(&broker, "push").await;
        let replies = open(&broker, "replies").await;
        let config = Arc::new(RelayConfig::new("a", "b").with_poll(crate::PollConfig {
            wait_time: Duration::from_millis(20),
            ..crate::PollConfig::default()
        }));
        let worker = Worker::new(config, replies);

        push.send(r#"{"id":"a","runId":"r"}"#.into(), Duration::ZERO)
            .await
            .unwrap();
        let inbound: QueuePtr = Arc::new(FailsOnce {
            inner: push,
            failed: AtomicBool::new(false),
        });

        let handle = worker.spawn(inbound);
        tokio::time::sleep(READ_ERROR_BACKOFF + Duration::from_millis(200)).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.message_count("replies"), 1);
        assert_eq!(broker.message_count("push"), 0);
    }

    #[tokio::test]
    async fn loop_stops_when_inbound_is_closed() {
        // ---
        let broker = MemoryBroker::new();
        let push = open(&broker, "push").await;
        let replies = open(&broker, "replies").await;
        let worker = Worker::new(Arc::new(RelayConfig::new("a", "b")), replies);

        push.close().await.unwrap();
        let finished = tokio::time::timeout(
            Duration::from_secs(1),
            worker.run(push, std::future::pending::<()>()),
        )
        .await;

        assert!(matches!(finished, Ok(Ok(()))));
    }
}
