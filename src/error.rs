use thiserror::Error;

/// Errors produced by dispatch, the worker and the queue implementations.
///
/// Every variant except [`RpcError::MalformedResponse`] and
/// [`RpcError::ReceiptInvalid`] is terminal for the operation that raised
/// it. Those two are absorbed inside the poll loop.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Required endpoint or identity is not configured.
    ///
    /// Raised before any queue interaction is attempted.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Caller or inbound payload is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The computed wait budget is zero; nothing was published.
    #[error("deadline too close")]
    DeadlineTooClose,

    /// Publishing to a queue failed.
    ///
    /// On the dispatcher side the poll phase is never entered. On the
    /// worker side the inbound delivery stays unacknowledged.
    #[error("send message: {0}")]
    Publish(String),

    /// A poll read failed for a reason other than the deadline.
    #[error("receive message: {0}")]
    ChannelRead(String),

    /// The deadline elapsed before a matching response arrived.
    ///
    /// The outcome of the request is unknown: the worker may still run and
    /// its response is orphaned.
    #[error("request timed out")]
    Timeout,

    /// A response body could not be parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A receipt handle no longer refers to the current lease on a message.
    #[error("receipt handle is no longer valid")]
    ReceiptInvalid,

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue handle was closed; no further operation will succeed.
    #[error("queue {0} closed")]
    Closed(String),

    /// Queue backend failure (connection, unknown backend).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Caller-visible outcome class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApiStatus {
    Ok,
    Timeout,
    Error,
}

impl RpcError {
    // ---
    /// Outcome class for the caller.
    ///
    /// Only `Timeout` and `DeadlineTooClose` report `TIMEOUT`; callers treat
    /// those as "outcome unknown" rather than "known failure".
    pub fn status(&self) -> ApiStatus {
        // ---
        match self {
            RpcError::Timeout | RpcError::DeadlineTooClose => ApiStatus::Timeout,
            _ => ApiStatus::Error,
        }
    }

    /// HTTP status code reported to the caller.
    pub fn http_status(&self) -> u16 {
        // ---
        match self {
            RpcError::Timeout | RpcError::DeadlineTooClose => 504,
            RpcError::Publish(_) => 502,
            RpcError::InvalidInput(_) => 400,
            _ => 500,
        }
    }
}

/// Result type alias for queue and dispatch operations.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn timeout_and_deadline_map_to_timeout_status() {
        // ---
        assert_eq!(RpcError::Timeout.status(), ApiStatus::Timeout);
        assert_eq!(RpcError::DeadlineTooClose.status(), ApiStatus::Timeout);
        assert_eq!(RpcError::Timeout.http_status(), 504);
        assert_eq!(RpcError::DeadlineTooClose.http_status(), 504);
    }

    #[test]
    fn failures_map_to_error_codes() {
        // ---
        let publish = RpcError::Publish("boom".into());
        assert_eq!(publish.status(), ApiStatus::Error);
        assert_eq!(publish.http_status(), 502);

        assert_eq!(RpcError::InvalidInput("x".into()).http_status(), 400);
        assert_eq!(RpcError::MissingConfig("x".into()).http_status(), 500);
        assert_eq!(RpcError::ChannelRead("x".into()).http_status(), 500);
    }

    #[test]
    fn status_serializes_uppercase() {
        // ---
        let s = serde_json::to_string(&ApiStatus::Timeout).unwrap();
        assert_eq!(s, "\"TIMEOUT\"");
    }
}
