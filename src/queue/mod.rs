//! Queue implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`Queue`](crate::Queue) trait. Broker-backed queues are hidden behind
//! feature flags and exposed only through constructor functions.
//!
//! Domain code must not depend on backend-specific types.

mod memory;
mod redis;

pub use memory::{create_memory_queue, create_memory_queue_with_broker, MemoryBroker};
pub use self::redis::create_redis_queue;
