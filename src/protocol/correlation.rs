use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::ResponseEnvelope;

/// Correlation ID for matching a request to its response.
///
/// 128 random bits (UUID v4) rendered as 32 lowercase hex characters with
/// no separators. This is the only key used for matching; two concurrently
/// outstanding calls colliding is not a practical concern.
///
/// # Format
///
/// `550e8400e29b41d4a9b6446655440000`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    // ---
    /// Generate a new unique correlation ID.
    pub fn generate() -> Self {
        // ---
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        // ---
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Logical run label supplied by the caller.
///
/// Used for grouping and observability. It is not required to be unique
/// and is only checked as a second field on match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    // ---
    /// Use the caller's label when it is non-blank, otherwise generate
    /// `run-<unix nanos>`.
    pub fn or_generate(label: Option<&str>) -> Self {
        // ---
        match label.map(str::trim) {
            Some(label) if !label.is_empty() => Self(label.to_string()),
            _ => Self(format!("run-{}", crate::clock::unix_nanos())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The pair a dispatcher waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub correlation_id: CorrelationId,
    pub run_id: RunId,
}

impl Identity {
    pub fn new(correlation_id: CorrelationId, run_id: RunId) -> Self {
        Self {
            correlation_id,
            run_id,
        }
    }

    /// True when both the correlation ID and the run ID of `response`
    /// equal this identity. Surrounding whitespace in the response is
    /// ignored.
    pub fn matches(&self, response: &ResponseEnvelope) -> bool {
        // ---
        response.id.trim() == self.correlation_id.as_str()
            && response.run_id.trim() == self.run_id.as_str()
    }
}
