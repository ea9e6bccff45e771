//! Filtered consume-or-release over a shared queue.
//!
//! Any number of independent waiters may read the same queue, each looking
//! for its own messages. One step of a waiter is:
//!
//! 1. read at most one message, with a long wait and a short lease;
//! 2. let the caller inspect it;
//! 3. act on the verdict:
//!    - **accept**: delete the message, it is consumed for good;
//!    - **poison**: delete the message, it can never be consumed;
//!    - **reject**: release the lease at once so the rightful waiter can
//!      see it, then back off briefly so two waiters do not bounce the same
//!      message back and forth in a tight loop.
//!
//! Deleting only on accept or poison, and never holding a lease on a
//! message the waiter will not consume, is what keeps concurrent waiters
//! from starving each other.
//!
//! Failing to delete or release is logged and otherwise ignored: the lease
//! lapses by itself and the message is read again.

use std::time::Duration;

use crate::{
    // ---
    log_debug,
    log_warn,
    Delivery,
    QueuePtr,
    ReceiveOptions,
    Result,
    RpcError,
};

/// Caller's verdict on an inspected message.
#[derive(Debug)]
pub enum Inspection<T> {
    /// The message is the one being waited for.
    Accept(T),

    /// Someone else's message.
    Reject,

    /// The message cannot be processed by anyone.
    Poison(String),
}

/// Outcome of one [`FilteredConsumer::poll_once`] step.
#[derive(Debug)]
pub enum PollStep<T> {
    /// Nothing was visible.
    Empty,

    /// A message was accepted and deleted.
    Accepted(T),

    /// A message was rejected and its lease released.
    Released,

    /// A poison message was deleted.
    Discarded,
}

/// Reads one message at a time from a shared queue and consumes, releases
/// or discards it according to the caller's inspection.
#[derive(Clone)]
pub struct FilteredConsumer {
    // ---
    queue: QueuePtr,
    options: ReceiveOptions,
    mismatch_backoff: Duration,
}

impl FilteredConsumer {
    // ---
    /// Create a consumer reading with the given long wait and lease.
    ///
    /// The batch size is always one: examining one message at a time keeps
    /// leases off messages this consumer will not take.
    pub fn new(
        queue: QueuePtr,
        wait_time: Duration,
        visibility_timeout: Duration,
        mismatch_backoff: Duration,
    ) -> Self {
        // ---
        Self {
            queue,
            options: ReceiveOptions::single(wait_time, visibility_timeout),
            mismatch_backoff,
        }
    }

    /// Perform one read-inspect-act step.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ChannelRead`] if the read itself fails. Failures
    /// to delete or release are not errors.
    pub async fn poll_once<T, F>(&self, inspect: F) -> Result<PollStep<T>>
    where
        F: FnOnce(&Delivery) -> Inspection<T>,
    {
        // ---
        let mut batch = self
            .queue
            .receive(self.options)
            .await
            .map_err(|e| RpcError::ChannelRead(e.to_string()))?;

        let Some(delivery) = batch.pop() else {
            return Ok(PollStep::Empty);
        };

        // Anything beyond the first is not ours to hold.
        for extra in batch {
            self.release(&extra).await;
        }

        match inspect(&delivery) {
            Inspection::Accept(value) => {
                self.delete(&delivery, "accepted").await;
                Ok(PollStep::Accepted(value))
            }
            Inspection::Poison(reason) => {
                log_warn!(
                    "{}: discarding poison message {}: {reason}",
                    self.queue.name(),
                    delivery.message_id
                );
                self.delete(&delivery, "poison").await;
                Ok(PollStep::Discarded)
            }
            Inspection::Reject => {
                self.release(&delivery).await;
                tokio::time::sleep(self.mismatch_backoff).await;
                Ok(PollStep::Released)
            }
        }
    }

    async fn delete(&self, delivery: &Delivery, why: &str) {
        // ---
        if let Err(err) = self.queue.delete(&delivery.receipt).await {
            log_warn!(
                "{}: failed to delete {} message {}: {err}",
                self.queue.name(),
                why,
                delivery.message_id
            );
        }
    }

    async fn release(&self, delivery: &Delivery) {
        // ---
        match self
            .queue
            .change_visibility(&delivery.receipt, Duration::ZERO)
            .await
        {
            Ok(()) => log_debug!(
                "{}: released message {} (receive #{})",
                self.queue.name(),
                delivery.message_id,
                delivery.attributes.receive_count
            ),
            Err(err) => log_warn!(
                "{}: failed to release message {}: {err}",
                self.queue.name(),
                delivery.message_id
            ),
        }
    }
}
