//! Lease queue on a Redis server using `redis`.
//!
//! ## Layout
//!
//! Each queue owns two kinds of keys under the prefix `mom-sync:{name}`:
//!
//! - `…:vis`: sorted set, member = message id, score = the instant (ms
//!   since epoch) from which the message is visible;
//! - `…:msg:{id}`: hash with `body`, `sent`, `first`, `count` and
//!   `receipt`, expiring after the retention period.
//!
//! Receiving, deleting and changing visibility are Lua scripts, so lease
//! bookkeeping is atomic on the server and any number of processes can
//! share a queue. A message whose hash expired is dropped from the sorted
//! set the next time a reader meets it.
//!
//! ## Long wait
//!
//! Redis has no blocking primitive for "first member with score ≤ now", so
//! `receive` re-runs the lease script every [`POLL_INTERVAL`] until a message
//! is leased or `wait_time` has passed.
//!
//! ## Cancellation
//!
//! Dropping a `receive` future after the lease script has run but before
//! its reply is read leaves the leased messages hidden until their lease
//! lapses. They are then redelivered as usual.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::Script;
use uuid::Uuid;

use crate::{
    //
    clamp_delay,
    clock,
    log_debug,
    log_error,
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

const POLL_INTERVAL: Duration = Duration::from_millis(50);

const RECEIVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local max = tonumber(ARGV[3])
local out = {}
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, max * 4)
for _, id in ipairs(ids) do
  if #out >= max then break end
  local key = ARGV[4] .. id
  if redis.call('EXISTS', key) == 0 then
    redis.call('ZREM', KEYS[1], id)
  else
    local count = redis.call('HINCRBY', key, 'count', 1)
    local first = tonumber(redis.call('HGET', key, 'first') or '0')
    if first == 0 then
      first = now
      redis.call('HSET', key, 'first', now)
    end
    local receipt = id .. '#' .. count .. '#' .. ARGV[5]
    redis.call('HSET', key, 'receipt', receipt)
    redis.call('ZADD', KEYS[1], now + tonumber(ARGV[2]), id)
    local body = redis.call('HGET', key, 'body')
    local sent = redis.call('HGET', key, 'sent')
    table.insert(out, {id, body, receipt, sent, tostring(first), tostring(count)})
  end
end
return out
"#;

const DELETE_SCRIPT: &str = r#"
local key = ARGV[1] .. ARGV[2]
if redis.call('HGET', key, 'receipt') ~= ARGV[3] then
  return 0
end
redis.call('DEL', key)
redis.call('ZREM', KEYS[1], ARGV[2])
return 1
"#;

const CHANGE_VISIBILITY_SCRIPT: &str = r#"
local key = ARGV[1] .. ARGV[2]
if redis.call('HGET', key, 'receipt') ~= ARGV[3] then
  return 0
end
redis.call('ZADD', KEYS[1], 'XX', tonumber(ARGV[4]), ARGV[2])
return 1
"#;

/// Row returned by the lease script:
/// `(id, body, receipt, sent_ms, first_receive_ms, receive_count)`.
type LeasedRow = (String, String, String, String, String, String);

fn transport_err(queue: &str, what: &str, err: redis::RedisError) -> RpcError {
    // ---
    let msg = format!("{queue}: {what} failed: {err}");
    log_error!("{msg}");
    RpcError::Transport(msg)
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Redis implementation of the [`Queue`] trait.
struct RedisQueue {
    // ---
    base: QueueBase,
    conn: MultiplexedConnection,
    visibility_key: String,
    message_prefix: String,
    retention: Duration,
    receive_script: Script,
    delete_script: Script,
    change_visibility_script: Script,
    closed: AtomicBool,
}

impl RedisQueue {
    // ---
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed(self.name().to_string()));
        }
        Ok(())
    }

    fn split_receipt<'a>(&self, receipt: &'a ReceiptHandle) -> Result<&'a str> {
        // ---
        receipt
            .0
            .split('#')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or(RpcError::ReceiptInvalid)
    }

    /// Run the lease script once.
    async fn lease(&self, options: &ReceiveOptions) -> Result<Vec<Delivery>> {
        // ---
        let mut conn = self.conn.clone();
        let nonce = Uuid::new_v4().simple().to_string();

        let rows: Vec<LeasedRow> = self
            .receive_script
            .key(&self.visibility_key)
            .arg(clock::unix_millis())
            .arg(millis(options.visibility_timeout))
            .arg(options.max_messages.max(1))
            .arg(&self.message_prefix)
            .arg(nonce)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| transport_err(self.name(), "receive", e))?;

        let source: Arc<str> = Arc::from(self.name());
        let parse = |s: &str| s.parse::<i64>().unwrap_or(0);

        Ok(rows
            .into_iter()
            .map(|(id, body, receipt, sent, first, count)| Delivery {
                message_id: Arc::from(id),
                body,
                receipt: ReceiptHandle::from(receipt),
                attributes: DeliveryAttributes {
                    sent_timestamp_ms: parse(&sent),
                    first_receive_timestamp_ms: parse(&first),
                    receive_count: parse(&count),
                },
                source_queue: source.clone(),
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl Queue for RedisQueue {
    // ---
    fn base(&self) -> &QueueBase {
        &self.base
    }

    async fn send(&self, body: String, delay: Duration) -> Result<Arc<str>> {
        // ---
        self.ensure_open()?;

        let id = Uuid::new_v4().simple().to_string();
        let key = format!("{}{id}", self.message_prefix);
        let sent = clock::unix_millis();
        let visible_at = sent + millis(clamp_delay(delay));

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("body")
            .arg(&body)
            .arg("sent")
            .arg(sent)
            .arg("first")
            .arg(0)
            .arg("count")
            .arg(0)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(millis(self.retention))
            .ignore()
            .cmd("ZADD")
            .arg(&self.visibility_key)
            .arg(visible_at)
            .arg(&id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| transport_err(self.name(), "send", e))?;

        Ok(Arc::from(id))
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<Delivery>> {
        // ---
        let wait_until = tokio::time::Instant::now() + options.wait_time;

        loop {
            self.ensure_open()?;

            let batch = self.lease(&options).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = tokio::time::Instant::now();
            if now >= wait_until {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(wait_until - now)).await;
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<()> {
        // ---
        self.ensure_open()?;
        let id = self.split_receipt(receipt)?;

        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_script
            .key(&self.visibility_key)
            .arg(&self.message_prefix)
            .arg(id)
            .arg(&*receipt.0)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| transport_err(self.name(), "delete", e))?;

        if deleted == 0 {
            return Err(RpcError::ReceiptInvalid);
        }
        Ok(())
    }

    async fn change_visibility(&self, receipt: &ReceiptHandle, timeout: Duration) -> Result<()> {
        // ---
        self.ensure_open()?;
        let id = self.split_receipt(receipt)?;
        let visible_at = clock::unix_millis() + millis(timeout);

        let mut conn = self.conn.clone();
        let changed: i64 = self
            .change_visibility_script
            .key(&self.visibility_key)
            .arg(&self.message_prefix)
            .arg(id)
            .arg(&*receipt.0)
            .arg(visible_at)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| transport_err(self.name(), "change visibility", e))?;

        if changed == 0 {
            return Err(RpcError::ReceiptInvalid);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing redis queue handle", self.name());
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Connect to the Redis server at `config.uri` and open the named queue.
///
/// # Errors
///
/// Returns [`RpcError::Transport`] if the URI is invalid or the server is
/// unreachable.
pub async fn create_queue(config: QueueConfig) -> Result<QueuePtr> {
    // ---
    log_debug!("{}: create redis queue at {}", config.name, config.uri);

    let client = redis::Client::open(config.uri.as_str())
        .map_err(|e| transport_err(&config.name, "open client", e))?;
    let conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| transport_err(&config.name, "connect", e))?;

    let prefix = format!("mom-sync:{}", config.name);

    Ok(Arc::new(RedisQueue {
        base: QueueBase::from(&config),
        conn,
        visibility_key: format!("{prefix}:vis"),
        message_prefix: format!("{prefix}:msg:"),
        retention: config.retention,
        receive_script: Script::new(RECEIVE_SCRIPT),
        delete_script: Script::new(DELETE_SCRIPT),
        change_visibility_script: Script::new(CHANGE_VISIBILITY_SCRIPT),
        closed: AtomicBool::new(false),
    }))
}
