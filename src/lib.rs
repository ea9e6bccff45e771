//! Synchronous request/response over asynchronous lease queues.
//!
//! A [`Dispatcher`] publishes a request to an inbound queue and blocks
//! until the correlated response shows up on a shared outbound queue,
//! consuming only its own response and releasing everyone else's. A
//! [`Worker`] answers requests from the inbound queue. Queues follow
//! visibility-timeout (lease) semantics: a read hides a message for a
//! while, a delete consumes it, and a zero-visibility change releases it.
//!
//! Two queue backends ship with the crate: an in-process one (always
//! available) and a Redis one behind the `transport_redis` feature.

// Import all sub modules once...
mod api;
mod clock;
mod consumer;
mod dispatcher;
mod domain;
mod error;
mod macros;
mod protocol;
mod queue;
mod queue_builder;
mod relay_config;
mod worker;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use api::{ApiReply, ApiRequest, ApiResponse};
pub use consumer::{FilteredConsumer, Inspection, PollStep};
pub use dispatcher::{DispatchRequest, Dispatcher};
pub use worker::{
    //
    BatchItemFailure,
    BatchOutcome,
    PassThrough,
    Processor,
    Worker,
    WorkerHandle,
    MAX_BATCH,
};

pub use error::{ApiStatus, Result, RpcError};
pub use queue_builder::QueueBuilder;
pub use relay_config::{DeadlinePolicy, PollConfig, RelayConfig};

pub use protocol::{
    //
    CorrelationId,
    DispatchOutput,
    Identity,
    RequestEnvelope,
    ResponseEnvelope,
    RunId,
};

pub use queue::{create_memory_queue, create_memory_queue_with_broker, create_redis_queue, MemoryBroker};

// --- public re-exports
pub use domain::{
    //
    clamp_delay,
    queue_name_from_arn,
    queue_name_from_url,
    Delivery,
    DeliveryAttributes,
    Queue,
    QueueBase,
    QueueConfig,
    QueuePtr,
    ReceiptHandle,
    ReceiveOptions,
    DEFAULT_RETENTION,
    MAX_DELAY,
    MAX_PADDING_BYTES,
};
