// src/domain/queue.rs

//! Queue domain abstractions.
//!
//! A queue here is an unordered, at-least-once, multi-consumer delivery
//! medium with a visibility lease: once a message is delivered to a reader
//! it is hidden from other readers until the lease expires, the message is
//! deleted, or the lease is released early.
//!
//! The dispatcher and worker only ever talk to a queue through the
//! [`Queue`] trait. Concrete implementations live under `src/queue/`.
//! Higher-level semantics such as correlation, filtering and deadlines are
//! handled elsewhere.

use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Longest publish delay a queue supports.
pub const MAX_DELAY: Duration = Duration::from_secs(900);

/// Largest filler a request body may carry.
///
/// Matches the 256 KiB message body limit of common queue
/// services.
pub const MAX_PADDING_BYTES: usize = 256 * 1024;

/// How long an undeleted message is kept before the queue drops it.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(4 * 24 * 60 * 60);

/// Clamp a publish delay into `[0, MAX_DELAY]`.
pub fn clamp_delay(delay: Duration) -> Duration {
    // ---
    delay.min(MAX_DELAY)
}

/// Extract a queue name from a queue URL.
///
/// `https://sqs.eu-west-1.amazonaws.com/123/replies?x=1` → `replies`
pub fn queue_name_from_url(url: &str) -> String {
    // ---
    let base = url.split('?').next().unwrap_or_default();
    base.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Extract a queue name from a resource name of the form
/// `arn:aws:sqs:region:account:queue`.
pub fn queue_name_from_arn(arn: &str) -> String {
    // ---
    arn.rsplit(':').next().unwrap_or_default().to_string()
}

/// Opaque token identifying one particular receive of a message.
///
/// Each receive issues a fresh handle. Operations with a handle from an
/// earlier receive fail with [`RpcError::ReceiptInvalid`](crate::RpcError).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub Arc<str>);

impl<T> From<T> for ReceiptHandle
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        ReceiptHandle(value.into())
    }
}

/// Channel metadata read alongside each delivered body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryAttributes {
    /// When the message was accepted by the queue (ms since epoch).
    pub sent_timestamp_ms: i64,

    /// When the message was first handed to any reader (ms since epoch).
    pub first_receive_timestamp_ms: i64,

    /// How many times the message has been handed out, this receive included.
    pub receive_count: i64,
}

/// A message handed to a reader, together with its lease.
#[derive(Clone, Debug)]
pub struct Delivery {
    // ---
    /// Queue-assigned message identifier. Stable across redeliveries.
    pub message_id: Arc<str>,

    /// Opaque text body.
    pub body: String,

    /// Handle for deleting the message or changing its lease.
    pub receipt: ReceiptHandle,

    pub attributes: DeliveryAttributes,

    /// Name of the queue the message was read from.
    pub source_queue: Arc<str>,
}

/// Parameters of one read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on the number of messages returned.
    pub max_messages: usize,

    /// Server-side long wait when nothing is visible.
    pub wait_time: Duration,

    /// Lease applied to every returned message.
    pub visibility_timeout: Duration,
}

impl ReceiveOptions {
    /// Read at most one message.
    pub fn single(wait_time: Duration, visibility_timeout: Duration) -> Self {
        Self {
            max_messages: 1,
            wait_time,
            visibility_timeout,
        }
    }
}

impl Default for ReceiveOptions {
    /// - `max_messages`: 1
    /// - `wait_time`: 20s
    /// - `visibility_timeout`: 30s
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared base state for all queue implementations.
///
/// Each concrete queue embeds this as a field named `base` and returns it
/// from [`Queue::base`].
#[derive(Clone, Debug)]
pub struct QueueBase {
    /// Queue name, used for logging and copied into envelopes.
    pub name: String,

    /// Location the queue was created from.
    pub uri: String,
}

impl From<&QueueConfig> for QueueBase {
    fn from(config: &QueueConfig) -> Self {
        // ---
        Self {
            name: config.name.clone(),
            uri: config.uri.clone(),
        }
    }
}

/// Configuration for creating a queue instance.
///
/// Passed to the queue factory functions (`create_*_queue()`).
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Backend URI (e.g. `"memory://replies"`, `"redis://localhost:6379"`).
    pub uri: String,

    /// Queue name.
    pub name: String,

    /// How long an undeleted message is kept.
    pub retention: Duration,
}

impl QueueConfig {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Lease-based queue abstraction.
///
/// Implementations must ensure that:
/// - a delivered message is hidden from other readers until its lease
///   expires, it is deleted, or its visibility is changed;
/// - `change_visibility(receipt, Duration::ZERO)` makes the message visible
///   to the next read;
/// - `receive` returns as soon as a message is visible, or after
///   `wait_time` with an empty batch;
/// - `receive` and `send` are cancel-safe: dropping the future leaves the
///   queue consistent.
///
/// No ordering is guaranteed. The in-memory queue is the reference
/// implementation of these semantics.
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &QueueBase;

    /// Returns the queue name.
    fn name(&self) -> &str {
        &self.base().name
    }

    /// Publish a text body, hidden from readers for `delay`.
    ///
    /// Delays longer than [`MAX_DELAY`] are clamped. Returns the
    /// queue-assigned message identifier.
    async fn send(&self, body: String, delay: Duration) -> Result<Arc<str>>;

    /// Read up to `options.max_messages` visible messages, leasing each one.
    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<Delivery>>;

    /// Remove a delivered message for good.
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<()>;

    /// Replace the remaining lease of a delivered message.
    async fn change_visibility(&self, receipt: &ReceiptHandle, timeout: Duration) -> Result<()>;

    /// Close the queue handle; subsequent operations fail.
    async fn close(&self) -> Result<()>;
}

/// Shared queue pointer.
///
/// `.clone()` is cheap and all clones refer to the same queue.
pub type QueuePtr = Arc<dyn Queue>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn name_from_url_strips_query_and_path() {
        // ---
        assert_eq!(
            queue_name_from_url("https://sqs.eu-west-1.amazonaws.com/123456789012/replies?a=b"),
            "replies"
        );
        assert_eq!(queue_name_from_url("memory://requests"), "requests");
        assert_eq!(queue_name_from_url("requests/"), "requests");
        assert_eq!(queue_name_from_url(""), "");
    }

    #[test]
    fn name_from_arn_takes_last_segment() {
        // ---
        assert_eq!(
            queue_name_from_arn("arn:aws:sqs:eu-west-1:123456789012:push"),
            "push"
        );
        assert_eq!(queue_name_from_arn("push"), "push");
    }

    #[test]
    fn delay_is_clamped() {
        // ---
        assert_eq!(clamp_delay(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(clamp_delay(Duration::from_secs(3600)), MAX_DELAY);
    }
}
