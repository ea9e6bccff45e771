//! Redis-backed lease queue.
//!
//! Available with the `transport_redis` feature. Without it the factory
//! returns an error so that [`QueueBuilder`](crate::QueueBuilder) can report
//! a useful message instead of failing to link.

#[cfg(feature = "transport_redis")]
#[allow(clippy::module_inception)]
mod redis;

#[cfg(feature = "transport_redis")]
pub use self::redis::create_queue as create_redis_queue;

#[cfg(not(feature = "transport_redis"))]
pub async fn create_redis_queue(_config: crate::QueueConfig) -> crate::Result<crate::QueuePtr> {
    Err(crate::RpcError::Transport(
        "transport_redis feature is not enabled".into(),
    ))
}
