use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use mom_sync::{
    //
    create_memory_queue_with_broker,
    ApiStatus,
    DispatchRequest,
    Dispatcher,
    MemoryBroker,
    PollConfig,
    Processor,
    QueueConfig,
    QueuePtr,
    RelayConfig,
    RequestEnvelope,
    Result,
    RpcError,
    Worker,
    WorkerHandle,
};

/// Dispatcher and worker wired to a private broker.
struct Relay {
    // ---
    broker: Arc<MemoryBroker>,
    push: QueuePtr,
    replies: QueuePtr,
    dispatcher: Dispatcher,
    config: Arc<RelayConfig>,
}

impl Relay {
    // ---
    async fn new() -> Result<Self> {
        // ---
        let broker = MemoryBroker::new();
        let push =
            create_memory_queue_with_broker(QueueConfig::new("memory://push", "push"), broker.clone())
                .await?;
        let replies = create_memory_queue_with_broker(
            QueueConfig::new("memory://replies", "replies"),
            broker.clone(),
        )
        .await?;

        let config = Arc::new(
            RelayConfig::new("memory://push", "memory://replies")
                .with_region("local")
                .with_poll(PollConfig {
                    wait_time: Duration::from_millis(50),
                    ..PollConfig::default()
                }),
        );
        let dispatcher = Dispatcher::new(config.clone(), push.clone(), replies.clone());

        Ok(Self {
            broker,
            push,
            replies,
            dispatcher,
            config,
        })
    }

    fn start_worker(&self, processor: Option<Arc<dyn Processor>>) -> WorkerHandle {
        // ---
        let worker = match processor {
            Some(p) => Worker::with_processor(self.config.clone(), self.replies.clone(), p),
            None => Worker::new(self.config.clone(), self.replies.clone()),
        };
        worker.spawn(self.push.clone())
    }
}

/// Remembers every request it sees.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<RequestEnvelope>>,
}

#[async_trait]
impl Processor for Recorder {
    async fn process(&self, request: &RequestEnvelope) -> Result<()> {
        self.seen.lock().unwrap().push(request.clone());
        Ok(())
    }
}

fn wait(ms: u64) -> DispatchRequest {
    DispatchRequest {
        max_wait: Some(Duration::from_millis(ms)),
        ..DispatchRequest::default()
    }
}

#[tokio::test]
async fn dispatch_gets_its_own_response_and_leaves_others() -> Result<()> {
    // ---
    init_logging();

    let relay = Relay::new().await?;
    relay
        .replies
        .send(r#"{"id":"xyz","runId":"other-run"}"#.into(), Duration::ZERO)
        .await?;
    let worker = relay.start_worker(None);

    let out = relay.dispatcher.dispatch(wait(2_000), None).await?;
    worker.shutdown().await?;

    assert_ne!(out.id, "xyz");
    assert!(out.run_id.starts_with("run-"));
    assert_eq!(out.region, "local");
    assert_eq!(out.push_queue_name, "push");
    assert_eq!(out.receive_queue_name, "replies");
    assert!(out.sqs_approx_receive_count >= 1);
    assert!(out.worker_receive_unix_nano >= out.send_start_unix_nano);

    // The foreign response is still there for its owner; the request was
    // acknowledged.
    assert_eq!(relay.broker.message_count("replies"), 1);
    assert_eq!(relay.broker.message_count("push"), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_dispatches_each_get_their_own_response() -> Result<()> {
    // ---
    init_logging();

    let relay = Relay::new().await?;
    let worker = relay.start_worker(None);

    let mut handles = Vec::new();
    for i in 0..10 {
        let dispatcher = relay.dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let request = DispatchRequest {
                run_id: Some(format!("run-{i}")),
                ..wait(5_000)
            };
            dispatcher.dispatch(request, None).await
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for (i, handle) in handles.into_iter().enumerate() {
        let out = handle.await.expect("dispatch task panicked")?;
        assert_eq!(out.run_id, format!("run-{i}"));
        assert!(ids.insert(out.id));
    }
    worker.shutdown().await?;

    assert_eq!(ids.len(), 10);
    assert_eq!(relay.broker.message_count("replies"), 0);
    Ok(())
}

#[tokio::test]
async fn malformed_response_is_discarded() -> Result<()> {
    // ---
    init_logging();

    let relay = Relay::new().await?;
    for body in ["{not json", "[]", r#"["abc","run-1"]"#] {
        relay.replies.send(body.into(), Duration::ZERO).await?;
    }
    let worker = relay.start_worker(None);

    relay.dispatcher.dispatch(wait(2_000), None).await?;
    worker.shutdown().await?;

    assert_eq!(relay.broker.message_count("replies"), 0);
    Ok(())
}

#[tokio::test]
async fn duplicate_response_is_orphaned_and_ignored() -> Result<()> {
    // ---
    init_logging();

    let relay = Relay::new().await?;
    let recorder = Arc::new(Recorder::default());
    let worker = relay.start_worker(Some(recorder.clone()));

    let first = relay.dispatcher.dispatch(wait(2_000), None).await?;

    // Redeliver the same request: the worker answers it a second time.
    let replayed = recorder.seen.lock().unwrap()[0].clone();
    assert_eq!(replayed.id, first.id);
    relay
        .push
        .send(serde_json::to_string(&replayed)?, Duration::ZERO)
        .await?;

    let second = relay.dispatcher.dispatch(wait(2_000), None).await?;
    worker.shutdown().await?;

    assert_ne!(first.id, second.id);
    assert_eq!(recorder.seen.lock().unwrap().len(), 3);
    // Only the duplicate answer to the first request remains.
    assert_eq!(relay.broker.message_count("replies"), 1);
    Ok(())
}

#[tokio::test]
async fn api_times_out_without_worker() -> Result<()> {
    // ---
    init_logging();

    let relay = Relay::new().await?;
    let started = Instant::now();

    let reply = relay
        .dispatcher
        .handle_api(r#"{"maxWaitMs":50}"#, None)
        .await;
    let response = reply.response()?;

    assert_eq!(reply.status_code, 504);
    assert_eq!(response.status, ApiStatus::Timeout);
    // Bounded by the budget plus one read wait (50ms) and some slack.
    let read_wait = relay.config.poll.wait_time.as_millis() as i64;
    assert!(response.total_ms >= 50);
    assert!(
        response.total_ms <= 50 + read_wait + 50,
        "took {}ms",
        response.total_ms
    );
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(response.output.is_none());
    assert!(response.error.is_some());

    // The request was published; its outcome is unknown.
    assert_eq!(relay.broker.message_count("push"), 1);
    Ok(())
}

#[tokio::test]
async fn api_refuses_when_host_deadline_is_too_close() -> Result<()> {
    // ---
    init_logging();

    let relay = Relay::new().await?;
    let reply = relay
        .dispatcher
        .handle_api("", Some(Instant::now() + Duration::from_millis(100)))
        .await;

    assert_eq!(reply.status_code, 504);
    assert_eq!(reply.response()?.status, ApiStatus::Timeout);
    assert_eq!(relay.broker.message_count("push"), 0);
    Ok(())
}

#[tokio::test]
async fn api_round_trip_and_bad_input() -> Result<()> {
    // ---
    init_logging();

    let relay = Relay::new().await?;
    let worker = relay.start_worker(None);

    let ok = relay
        .dispatcher
        .handle_api(
            r#"{"runId":"api-run","messageBodyBytes":128,"delaySeconds":-5,"maxWaitMs":2000}"#,
            None,
        )
        .await;
    let bad = relay.dispatcher.handle_api("{oops", None).await;
    let huge = relay
        .dispatcher
        .handle_api(r#"{"messageBodyBytes":9223372036854775807,"maxWaitMs":2000}"#, None)
        .await;
    worker.shutdown().await?;

    assert_eq!(ok.status_code, 200);
    let response = ok.response()?;
    assert_eq!(response.status, ApiStatus::Ok);
    let output = response.output.expect("output on success");
    assert_eq!(output.run_id, "api-run");

    assert_eq!(huge.status_code, 200, "{}", huge.body);

    assert_eq!(bad.status_code, 400);
    assert_eq!(bad.response()?.status, ApiStatus::Error);
    Ok(())
}

#[tokio::test]
async fn closed_reply_queue_is_a_read_error() -> Result<()> {
    // ---
    init_logging();

    let relay = Relay::new().await?;
    relay.replies.close().await?;

    let err = relay.dispatcher.dispatch(wait(500), None).await.unwrap_err();
    assert!(matches!(err, RpcError::ChannelRead(_)), "{err}");
    Ok(())
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
