//! Process-wide relay configuration.
//!
//! A [`RelayConfig`] is built once at startup, wrapped in an `Arc` and
//! handed to every dispatcher and worker. Nothing in it changes after
//! construction, so concurrent calls never race on (re)initialization.

use std::time::Duration;

use crate::{queue_name_from_url, Result, RpcError};

/// Bounds applied to the caller's requested wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlinePolicy {
    /// Wait used when the caller asks for none (or a non-positive one).
    pub default_wait: Duration,

    /// Hard ceiling beneath the hosting environment's own timeout.
    pub ceiling: Duration,

    /// Subtracted from an externally observed deadline.
    pub safety_margin: Duration,
}

impl Default for DeadlinePolicy {
    /// - `default_wait`: 25s
    /// - `ceiling`: 28s
    /// - `safety_margin`: 250ms
    fn default() -> Self {
        Self {
            default_wait: Duration::from_secs(25),
            ceiling: Duration::from_secs(28),
            safety_margin: Duration::from_millis(250),
        }
    }
}

/// Parameters of the response poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Server-side long wait of each read.
    pub wait_time: Duration,

    /// Lease taken on each inspected response.
    ///
    /// Long enough to inspect and act on one message; short enough that a
    /// crashed reader does not hide it from the rightful waiter for long.
    pub visibility_timeout: Duration,

    /// Pause after releasing somebody else's response.
    pub mismatch_backoff: Duration,

    /// Pause after a read that came back empty without waiting.
    pub empty_backoff: Duration,
}

impl Default for PollConfig {
    /// - `wait_time`: 20s
    /// - `visibility_timeout`: 10s
    /// - `mismatch_backoff`: 20ms
    /// - `empty_backoff`: 20ms
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(10),
            mismatch_backoff: Duration::from_millis(20),
            empty_backoff: Duration::from_millis(20),
        }
    }
}

/// Relay configuration shared by dispatcher and worker.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    // ---
    /// Location of the inbound (request) queue.
    pub push_queue_url: String,

    /// Location of the outbound (response) queue.
    pub receive_queue_url: String,

    /// Region label copied into envelopes. Empty when unknown.
    pub region: String,

    pub deadline: DeadlinePolicy,
    pub poll: PollConfig,
}

impl RelayConfig {
    /// Create a configuration for the given queue pair with default
    /// deadline and poll settings.
    pub fn new(push_queue_url: impl Into<String>, receive_queue_url: impl Into<String>) -> Self {
        Self {
            push_queue_url: push_queue_url.into(),
            receive_queue_url: receive_queue_url.into(),
            region: String::new(),
            deadline: DeadlinePolicy::default(),
            poll: PollConfig::default(),
        }
    }

    /// Read the configuration from the process environment.
    ///
    /// - `PUSH_QUEUE_URL` (required)
    /// - `RECEIVE_QUEUE_URL` (required)
    /// - `AWS_REGION`, falling back to `REGION` (optional)
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MissingConfig`] if a required variable is unset
    /// or blank.
    pub fn from_env() -> Result<Self> {
        // ---
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| RpcError::MissingConfig(format!("missing env {key}")))
        };

        let push = required("PUSH_QUEUE_URL")?;
        let receive = required("RECEIVE_QUEUE_URL")?;
        let region = lookup("AWS_REGION")
            .or_else(|| lookup("REGION"))
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        Ok(Self::new(push, receive).with_region(region))
    }

    /// Set the region label.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Replace the deadline policy.
    pub fn with_deadline_policy(mut self, policy: DeadlinePolicy) -> Self {
        self.deadline = policy;
        self
    }

    /// Replace the poll settings.
    ///
    /// # Example
    ///
    /// ```
    /// use mom_sync::{PollConfig, RelayConfig};
    /// use std::time::Duration;
    ///
    /// let config = RelayConfig::new("memory://push", "memory://replies").with_poll(PollConfig {
    ///     wait_time: Duration::from_secs(1),
    ///     ..PollConfig::default()
    /// });
    /// ```
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Name of the inbound queue, derived from its URL.
    pub fn push_queue_name(&self) -> String {
        queue_name_from_url(&self.push_queue_url)
    }

    /// Name of the outbound queue, derived from its URL.
    pub fn receive_queue_name(&self) -> String {
        queue_name_from_url(&self.receive_queue_url)
    }
}
