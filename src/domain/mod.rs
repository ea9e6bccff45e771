//! Domain layer public interface.
//!
//! This module defines the queue abstraction the dispatcher and worker are
//! written against. It is independent of any concrete queue service.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod queue;

// --- Queue domain re-exports ---

pub use queue::{
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
