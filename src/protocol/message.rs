use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{CorrelationId, RunId};
use crate::MAX_PADDING_BYTES;

// Envelopes are JSON objects. Serde's derive also accepts a sequence and
// maps it onto the fields by position, so the shape is checked first.
fn object_from_str<T: DeserializeOwned>(body: &str) -> serde_json::Result<T> {
    // ---
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(body)?;
    serde_json::from_value(serde_json::Value::Object(map))
}

/// Request published by the dispatcher to the inbound queue.
///
/// Absent fields decode as empty; the worker rejects a request without an
/// `id` or `runId`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestEnvelope {
    /// Correlation ID.
    pub id: String,
    pub send_unix_nano: i64,
    pub send_start_unix_nano: i64,
    pub run_id: String,

    /// Filler used to grow the message body to a requested size.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub padding: String,
}

impl RequestEnvelope {
    // ---
    /// Build a request carrying `padding_bytes` filler characters, at most
    /// [`MAX_PADDING_BYTES`].
    pub fn new(
        correlation_id: &CorrelationId,
        run_id: &RunId,
        send_unix_nano: i64,
        send_start_unix_nano: i64,
        padding_bytes: usize,
    ) -> Self {
        // ---
        Self {
            id: correlation_id.to_string(),
            send_unix_nano,
            send_start_unix_nano,
            run_id: run_id.to_string(),
            padding: "x".repeat(padding_bytes.min(MAX_PADDING_BYTES)),
        }
    }

    /// Decode a request body. Anything but a JSON object is an error.
    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        object_from_str(body)
    }
}

/// Response published by the worker to the outbound queue.
///
/// Every field defaults when absent: a body that is valid JSON but misses
/// fields still parses, and simply fails to match anyone's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseEnvelope {
    /// Correlation ID copied from the request.
    pub id: String,
    pub run_id: String,

    pub region: String,
    pub push_queue_name: String,
    pub receive_queue_name: String,

    // Originating marks copied from the request.
    pub send_unix_nano: i64,
    pub send_start_unix_nano: i64,

    pub worker_receive_unix_nano: i64,
    pub worker_done_unix_nano: i64,
    pub callback_send_start_unix_nano: i64,
    pub callback_send_end_unix_nano: i64,

    // Provenance of the inbound delivery.
    pub sqs_sent_timestamp_ms: i64,
    pub sqs_first_receive_timestamp_ms: i64,
    pub sqs_approx_receive_count: i64,
}

impl ResponseEnvelope {
    /// Decode a response body. Anything but a JSON object is an error.
    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        object_from_str(body)
    }
}

/// Result of a successful dispatch.
///
/// Local marks are taken by the dispatcher; everything prefixed `worker`,
/// `callback` or `sqs` is copied verbatim from the matched response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutput {
    pub run_id: String,
    pub id: String,

    pub region: String,
    pub push_queue_name: String,
    pub receive_queue_name: String,

    pub dispatch_start_unix_nano: i64,
    pub send_unix_nano: i64,
    pub send_start_unix_nano: i64,
    pub send_end_unix_nano: i64,

    pub poll_start_unix_nano: i64,
    pub poll_end_unix_nano: i64,

    pub worker_receive_unix_nano: i64,
    pub worker_done_unix_nano: i64,
    pub callback_send_start_unix_nano: i64,
    pub callback_send_end_unix_nano: i64,
    pub receive_message_unix_nano: i64,
    pub sqs_sent_timestamp_ms: i64,
    pub sqs_first_receive_timestamp_ms: i64,
    pub sqs_approx_receive_count: i64,
}
