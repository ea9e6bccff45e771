//! Queue builder for creating queue instances.
//!
//! Provides a fluent builder API for opening a queue by URI, with the
//! backend inferred from the URI scheme unless set explicitly.

use std::time::Duration;

use crate::{queue_name_from_url, QueueConfig, QueuePtr, Result, RpcError, DEFAULT_RETENTION};

/// Builder for opening queues.
///
/// # Examples
///
/// ## In-memory queue named after the URI
/// ```no_run
/// use mom_sync::QueueBuilder;
///
/// # async fn example() -> mom_sync::Result<()> {
/// let queue = QueueBuilder::new()
///     .uri("memory://replies")
///     .build()
///     .await?;
/// assert_eq!(queue.name(), "replies");
/// # Ok(())
/// # }
/// ```
///
/// ## Redis queue with an explicit name
/// ```no_run
/// use mom_sync::QueueBuilder;
///
/// # async fn example() -> mom_sync::Result<()> {
/// let queue = QueueBuilder::new()
///     .uri("redis://localhost:6379")
///     .name("replies")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueBuilder {
    uri: Option<String>,
    name: Option<String>,
    queue_type: Option<String>,
    retention: Option<Duration>,
}

impl QueueBuilder {
    /// Create a new queue builder.
    pub fn new() -> Self {
        Self {
            uri: None,
            name: None,
            queue_type: None,
            retention: None,
        }
    }

    /// Set the queue URI (required).
    ///
    /// Examples:
    /// - `"memory://replies"`
    /// - `"redis://localhost:6379"`
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the queue name.
    ///
    /// Defaults to the last path segment of the URI.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the backend explicitly: `"memory"` or `"redis"`.
    ///
    /// If not specified, the URI scheme decides.
    pub fn queue_type(mut self, queue_type: impl Into<String>) -> Self {
        self.queue_type = Some(queue_type.into());
        self
    }

    /// How long undeleted messages are kept. Default: 4 days.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Open the queue (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `uri` is missing
    /// - no name is given and none can be derived from the URI
    /// - the backend is unknown or disabled
    /// - the backend fails to connect
    pub async fn build(self) -> Result<QueuePtr> {
        // ---
        let uri = self
            .uri
            .ok_or_else(|| RpcError::MissingConfig("uri".into()))?;

        let name = match self.name {
            Some(name) => name,
            None if uri.starts_with("redis") => String::new(),
            None => queue_name_from_url(uri.trim_start_matches("memory://")),
        };
        if name.trim().is_empty() {
            return Err(RpcError::MissingConfig("queue name".into()));
        }

        let queue_type = match self.queue_type {
            Some(t) => t,
            None => scheme_to_type(&uri)?,
        };

        let config = QueueConfig {
            uri,
            name,
            retention: self.retention.unwrap_or(DEFAULT_RETENTION),
        };

        match queue_type.as_str() {
            "memory" => crate::create_memory_queue(config).await,
            "redis" => crate::create_redis_queue(config).await,
            other => Err(RpcError::Transport(format!(
                "unrecognized queue_type: {other}, valid values: memory, redis"
            ))),
        }
    }
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn scheme_to_type(uri: &str) -> Result<String> {
    // ---
    let scheme = uri.split("://").next().unwrap_or_default();
    match scheme {
        "memory" => Ok("memory".into()),
        "redis" | "rediss" => Ok("redis".into()),
        _ => Err(RpcError::Transport(format!(
            "cannot infer queue type from uri: {uri}"
        ))),
    }
}
