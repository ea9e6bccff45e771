//! Synchronous request/response over a pair of lease queues.
//!
//! A [`Dispatcher`] publishes one request to the inbound queue and then
//! waits on the shared outbound queue for the response carrying the same
//! correlation id and run id. Many dispatches, in this process or in
//! others, may wait on the same outbound queue at once; each one consumes
//! only its own response and releases everything else at once.
//!
//! Every dispatch has one absolute deadline, computed from the caller's
//! requested wait and the hosting environment's own deadline (see
//! [`DeadlinePolicy::effective_timeout`](crate::DeadlinePolicy::effective_timeout)).
//! Publishing and every read run under it; when it passes, whatever is in
//! flight is abandoned and the call fails with [`RpcError::Timeout`].

mod deadline;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use crate::{
    // ---
    clamp_delay,
    clock,
    log_debug,
    log_info,
    CorrelationId,
    Delivery,
    DispatchOutput,
    FilteredConsumer,
    Identity,
    Inspection,
    PollStep,
    QueueBuilder,
    QueuePtr,
    RelayConfig,
    RequestEnvelope,
    ResponseEnvelope,
    Result,
    RpcError,
    RunId,
};

/// A read that returns empty faster than this did not really wait.
const EMPTY_READ_FLOOR: Duration = Duration::from_millis(5);

/// Parameters of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Caller-supplied run label. Blank or absent means "generate one".
    pub run_id: Option<String>,

    /// Delivery delay of the request; clamped to 15 minutes.
    pub delay: Duration,

    /// Filler bytes added to the request body.
    pub padding_bytes: usize,

    /// Requested wait. `None` or zero selects the default.
    pub max_wait: Option<Duration>,
}

/// Publishes requests and waits for their correlated responses.
///
/// Cheap to clone; clones share the same queues and configuration.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<RelayConfig>,
    push: QueuePtr,
    replies: FilteredConsumer,
    push_queue_name: String,
    receive_queue_name: String,
}

impl Dispatcher {
    // ---
    /// Create a dispatcher over already opened queues.
    ///
    /// - `push`: inbound queue the worker reads requests from
    /// - `receive`: shared outbound queue the worker publishes responses to
    pub fn new(config: Arc<RelayConfig>, push: QueuePtr, receive: QueuePtr) -> Self {
        // ---
        let replies = FilteredConsumer::new(
            receive.clone(),
            config.poll.wait_time,
            config.poll.visibility_timeout,
            config.poll.mismatch_backoff,
        );

        Self {
            inner: Arc::new(Inner {
                push_queue_name: push.name().to_string(),
                receive_queue_name: receive.name().to_string(),
                config,
                push,
                replies,
            }),
        }
    }

    /// Open both queues from the URLs in `config` and create a dispatcher.
    ///
    /// # Errors
    ///
    /// Fails if either queue cannot be opened; see [`QueueBuilder::build`].
    pub async fn connect(config: Arc<RelayConfig>) -> Result<Self> {
        // ---
        let push = QueueBuilder::new()
            .uri(config.push_queue_url.as_str())
            .name(config.push_queue_name())
            .build()
            .await?;
        let receive = QueueBuilder::new()
            .uri(config.receive_queue_url.as_str())
            .name(config.receive_queue_name())
            .build()
            .await?;

        Ok(Self::new(config, push, receive))
    }

    /// Shared configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Publish one request and wait for its response.
    ///
    /// `env_deadline` is the deadline of the surrounding invocation, if the
    /// host exposes one.
    ///
    /// # Errors
    ///
    /// - [`RpcError::DeadlineTooClose`]: no time left; nothing was published
    /// - [`RpcError::Publish`]: the request could not be sent
    /// - [`RpcError::ChannelRead`]: reading the outbound queue failed
    /// - [`RpcError::Timeout`]: the deadline passed before the response came
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        env_deadline: Option<Instant>,
    ) -> Result<DispatchOutput> {
        // ---
        let inner = &self.inner;

        let budget = inner
            .config
            .deadline
            .effective_timeout(request.max_wait, env_deadline);
        if budget.is_zero() {
            return Err(RpcError::DeadlineTooClose);
        }
        let deadline = Instant::now() + budget;

        let identity = Identity::new(
            CorrelationId::generate(),
            RunId::or_generate(request.run_id.as_deref()),
        );

        let dispatch_start = clock::unix_nanos();
        let send_unix_nano = clock::unix_nanos();
        let send_start_unix_nano = clock::unix_nanos();

        let envelope = RequestEnvelope::new(
            &identity.correlation_id,
            &identity.run_id,
            send_unix_nano,
            send_start_unix_nano,
            request.padding_bytes,
        );
        let body = serde_json::to_string(&envelope)?;

        match timeout_at(deadline, inner.push.send(body, clamp_delay(request.delay))).await {
            Err(_elapsed) => return Err(RpcError::Timeout),
            Ok(Err(e)) => return Err(RpcError::Publish(e.to_string())),
            Ok(Ok(message_id)) => {
                log_debug!(
                    "{}: published {} as message {message_id}",
                    inner.push_queue_name,
                    identity.correlation_id
                );
            }
        }
        let send_end_unix_nano = clock::unix_nanos();

        let poll_start_unix_nano = clock::unix_nanos();
        let (response, receive_message_unix_nano) =
            match timeout_at(deadline, self.await_response(&identity, deadline)).await {
                Err(_elapsed) => return Err(RpcError::Timeout),
                Ok(result) => result?,
            };
        let poll_end_unix_nano = clock::unix_nanos();

        log_info!(
            "dispatch {} (run {}) answered after {}ms",
            identity.correlation_id,
            identity.run_id,
            (poll_end_unix_nano - dispatch_start) / 1_000_000
        );

        Ok(DispatchOutput {
            run_id: identity.run_id.to_string(),
            id: identity.correlation_id.to_string(),
            region: inner.config.region.clone(),
            push_queue_name: inner.push_queue_name.clone(),
            receive_queue_name: inner.receive_queue_name.clone(),
            dispatch_start_unix_nano: dispatch_start,
            send_unix_nano,
            send_start_unix_nano,
            send_end_unix_nano,
            poll_start_unix_nano,
            poll_end_unix_nano,
            worker_receive_unix_nano: response.worker_receive_unix_nano,
            worker_done_unix_nano: response.worker_done_unix_nano,
            callback_send_start_unix_nano: response.callback_send_start_unix_nano,
            callback_send_end_unix_nano: response.callback_send_end_unix_nano,
            receive_message_unix_nano,
            sqs_sent_timestamp_ms: response.sqs_sent_timestamp_ms,
            sqs_first_receive_timestamp_ms: response.sqs_first_receive_timestamp_ms,
            sqs_approx_receive_count: response.sqs_approx_receive_count,
        })
    }

    // Consume-or-release until our response shows up. Returns the response
    // and the wall-clock time it was read.
    async fn await_response(
        &self,
        identity: &Identity,
        deadline: Instant,
    ) -> Result<(ResponseEnvelope, i64)> {
        // ---
        let inner = &self.inner;

        loop {
            if Instant::now() >= deadline {
                return Err(RpcError::Timeout);
            }

            let started = Instant::now();
            let step = inner
                .replies
                .poll_once(|delivery| inspect(identity, delivery))
                .await?;

            match step {
                PollStep::Accepted(found) => return Ok(found),
                PollStep::Empty => {
                    if started.elapsed() < EMPTY_READ_FLOOR {
                        tokio::time::sleep(inner.config.poll.empty_backoff).await;
                    }
                }
                PollStep::Released | PollStep::Discarded => {}
            }
        }
    }
}

fn inspect(identity: &Identity, delivery: &Delivery) -> Inspection<(ResponseEnvelope, i64)> {
    // ---
    let received = clock::unix_nanos();

    match ResponseEnvelope::from_json(&delivery.body) {
        Err(e) => Inspection::Poison(RpcError::MalformedResponse(e.to_string()).to_string()),
        Ok(response) if identity.matches(&response) => Inspection::Accept((response, received)),
        Ok(_) => Inspection::Reject,
    }
}
