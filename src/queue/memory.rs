//! In-memory queue implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`Queue`] trait. It is the reference for queue semantics and the backend
//! used by the integration tests.
//!
//! ## Reference Semantics
//!
//! - Delivery is at-least-once and unordered-tolerant: readers must not rely
//!   on send order, although visible messages are handed out in the order
//!   they became visible. A released message therefore goes to the back.
//! - A received message is leased to its reader for the visibility timeout
//!   and hidden from every other reader until the lease lapses, the message
//!   is deleted, or its visibility is changed.
//! - Every receive issues a fresh receipt handle and bumps the receive
//!   count. Handles from earlier receives are rejected.
//! - `receive` long-waits: it is woken by sends, by released leases and by
//!   lease expiry, and returns an empty batch once `wait_time` has passed.
//! - Messages older than the retention period are dropped when the queue
//!   is next touched. Nothing else removes orphaned messages.
//!
//! ## Non-Goals
//!
//! This queue does not emulate persistence, network failures or the exact
//! sampling behavior of a distributed queue service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::{
    // ---
    clamp_delay,
    clock,
    log_debug,
    log_trace,
    Delivery,
    DeliveryAttributes,
    Queue,
    QueueBase,
    QueueConfig,
    QueuePtr,
    ReceiptHandle,
    ReceiveOptions,
    Result,
    RpcError,
};

/// Acquire a mutex guard, ignoring poisoning.
///
/// Every mutation below leaves the message table consistent before it can
/// panic, so a poisoned table is still usable.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared set of named in-memory queues.
///
/// Simulates a queue service within a single process. All [`MemoryQueue`]
/// handles created from the same broker with the same name share one
/// message table, exactly as clients of a real service would.
///
/// Tests that run in parallel should construct their own broker and pass it
/// to [`create_memory_queue_with_broker`].
pub struct MemoryBroker {
    // ---
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
}

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Number of messages currently stored under `name`, leased or not.
    ///
    /// Returns 0 for a queue that was never created.
    pub fn message_count(&self, name: &str) -> usize {
        // ---
        let state = lock_ignore_poison(&self.queues).get(name).cloned();
        state.map_or(0, |state| lock_ignore_poison(&state.table).messages.len())
    }

    fn queue(&self, name: &str, retention: Duration) -> Arc<QueueState> {
        // ---
        let mut queues = lock_ignore_poison(&self.queues);
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                log_debug!("memory broker: create queue {name}");
                Arc::new(QueueState::new(retention))
            })
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

/// Process-global broker used by [`create_memory_queue`].
static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

fn global_broker() -> Arc<MemoryBroker> {
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}

struct StoredMessage {
    // ---
    id: Arc<str>,
    body: String,
    seq: u64,
    sent_at: Instant,
    sent_timestamp_ms: i64,
    visible_at: Instant,
    first_receive_timestamp_ms: i64,
    receive_count: i64,

    /// Receipt issued by the most recent receive.
    receipt: Option<Arc<str>>,
}

#[derive(Default)]
struct Table {
    messages: HashMap<Arc<str>, StoredMessage>,
    next_seq: u64,
}

/// Message table of one named queue.
struct QueueState {
    // ---
    table: Mutex<Table>,
    retention: Duration,

    /// Woken whenever a message may have become visible.
    visible: Notify,
}

impl QueueState {
    // ---
    fn new(retention: Duration) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            retention,
            visible: Notify::new(),
        }
    }

    fn push(&self, body: String, delay: Duration) -> Arc<str> {
        // ---
        let now = Instant::now();
        let id: Arc<str> = Arc::from(Uuid::new_v4().simple().to_string());

        {
            let mut table = lock_ignore_poison(&self.table);
            let seq = table.next_seq;
            table.next_seq += 1;
            table.messages.insert(
                id.clone(),
                StoredMessage {
                    id: id.clone(),
                    body,
                    seq,
                    sent_at: now,
                    sent_timestamp_ms: clock::unix_millis(),
                    visible_at: now + delay,
                    first_receive_timestamp_ms: 0,
                    receive_count: 0,
                    receipt: None,
                },
            );
        }

        self.visible.notify_waiters();
        id
    }

    /// Lease up to `options.max_messages` visible messages.
    ///
    /// Also returns the earliest instant at which a currently hidden
    /// message becomes visible, so the caller knows when to look again.
    fn take_visible(
        &self,
        queue_name: &Arc<str>,
        options: &ReceiveOptions,
    ) -> (Vec<Delivery>, Option<Instant>) {
        // ---
        let now = Instant::now();
        let mut table = lock_ignore_poison(&self.table);

        let retention = self.retention;
        table
            .messages
            .retain(|_, m| now.saturating_duration_since(m.sent_at) < retention);

        let mut ready: Vec<(Instant, u64, Arc<str>)> = table
            .messages
            .values()
            .filter(|m| m.visible_at <= now)
            .map(|m| (m.visible_at, m.seq, m.id.clone()))
            .collect();
        ready.sort_unstable_by_key(|(at, seq, _)| (*at, *seq));
        ready.truncate(options.max_messages);

        let mut batch = Vec::with_capacity(ready.len());
        for (_, _, id) in ready {
            if let Some(m) = table.messages.get_mut(&id) {
                m.receive_count += 1;
                if m.first_receive_timestamp_ms == 0 {
                    m.first_receive_timestamp_ms = clock::unix_millis();
                }
                m.visible_at = now + options.visibility_timeout;

                let receipt: Arc<str> = Arc::from(format!("{}#{}", m.id, m.receive_count));
                m.receipt = Some(receipt.clone());

                batch.push(Delivery {
                    message_id: m.id.clone(),
                    body: m.body.clone(),
                    receipt: ReceiptHandle(receipt),
                    attributes: DeliveryAttributes {
                        sent_timestamp_ms: m.sent_timestamp_ms,
                        first_receive_timestamp_ms: m.first_receive_timestamp_ms,
                        receive_count: m.receive_count,
                    },
                    source_queue: queue_name.clone(),
                });
            }
        }

        let next_visible = table
            .messages
            .values()
            .map(|m| m.visible_at)
            .filter(|at| *at > now)
            .min();

        (batch, next_visible)
    }

    /// Run `f` on the message the receipt refers to, if the receipt is
    /// still the current one.
    fn with_leased<R>(
        &self,
        receipt: &ReceiptHandle,
        f: impl FnOnce(&mut Table, Arc<str>) -> R,
    ) -> Result<R> {
        // ---
        let (id, _) = receipt
            .0
            .rsplit_once('#')
            .ok_or(RpcError::ReceiptInvalid)?;

        let mut table = lock_ignore_poison(&self.table);
        let (key, current) = match table.messages.get_key_value(id) {
            Some((key, m)) => (key.clone(), m.receipt.clone()),
            None => return Err(RpcError::ReceiptInvalid),
        };

        if current.as_deref() != Some(&*receipt.0) {
            return Err(RpcError::ReceiptInvalid);
        }

        Ok(f(&mut table, key))
    }
}

/// Handle to one named queue on a [`MemoryBroker`].
struct MemoryQueue {
    // ---
    base: QueueBase,
    name: Arc<str>,
    state: Arc<QueueState>,
    closed: AtomicBool,
    closing: Notify,
}

impl MemoryQueue {
    // ---
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed(self.name.to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Queue for MemoryQueue {
    // ---
    fn base(&self) -> &QueueBase {
        &self.base
    }

    async fn send(&self, body: String, delay: Duration) -> Result<Arc<str>> {
        // ---
        self.ensure_open()?;
        let id = self.state.push(body, clamp_delay(delay));
        log_trace!("{}: sent {id} (delay {delay:?})", self.name);
        Ok(id)
    }

    /// Lease visible messages, long-waiting up to `options.wait_time`.
    ///
    /// Cancel-safe: messages are only leased inside the synchronous
    /// `take_visible` step, never across an await point.
    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<Delivery>> {
        // ---
        let wait_until = Instant::now() + options.wait_time;

        loop {
            let visible = self.state.visible.notified();
            let closing = self.closing.notified();
            tokio::pin!(visible);
            tokio::pin!(closing);
            visible.as_mut().enable();
            closing.as_mut().enable();

            self.ensure_open()?;

            let (batch, next_visible) = self.state.take_visible(&self.name, &options);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= wait_until {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map_or(wait_until, |at| at.min(wait_until));

            tokio::select! {
                _ = &mut visible => {}
                _ = &mut closing => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.state.with_leased(receipt, |table, id| {
            table.messages.remove(&id);
        })?;
        log_trace!("{}: deleted {}", self.name, receipt.0);
        Ok(())
    }

    async fn change_visibility(&self, receipt: &ReceiptHandle, timeout: Duration) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.state.with_leased(receipt, |table, id| {
            let seq = table.next_seq;
            table.next_seq += 1;
            if let Some(m) = table.messages.get_mut(&id) {
                m.visible_at = Instant::now() + timeout;
                m.seq = seq;
            }
        })?;
        self.state.visible.notify_waiters();
        Ok(())
    }

    /// Close this handle.
    ///
    /// Messages stay in the broker; other handles to the same queue keep
    /// working. Receives blocked on this handle return an error.
    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing queue handle", self.name);
        self.closed.store(true, Ordering::Release);
        self.closing.notify_waiters();
        Ok(())
    }
}

/// Create an in-memory queue on the process-global broker.
///
/// All queues created with this function share a single broker, matching
/// clients connected to the same queue service.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_queue(config: QueueConfig) -> Result<QueuePtr> {
    // ---
    create_memory_queue_with_broker(config, global_broker()).await
}

/// Create an in-memory queue on the provided broker.
///
/// Used by tests that need isolation from each other.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_queue_with_broker(
    config: QueueConfig,
    broker: Arc<MemoryBroker>,
) -> Result<QueuePtr> {
    // ---
    log_debug!("{}: create memory queue", config.name);

    let state = broker.queue(&config.name, config.retention);
    let queue = MemoryQueue {
        base: QueueBase::from(&config),
        name: Arc::from(config.name.as_str()),
        state,
        closed: AtomicBool::new(false),
        closing: Notify::new(),
    };

    Ok(Arc::new(queue))
}
