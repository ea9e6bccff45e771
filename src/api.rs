//! JSON request/response surface over [`Dispatcher::dispatch`].
//!
//! Accepts the body of an HTTP-style call, runs one dispatch and renders
//! the outcome as a status code plus a JSON body. Everything about the
//! input is lenient: an empty body means "all defaults", out-of-range
//! numbers are clamped. Only a body that is not JSON at all is refused.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    // ---
    log_warn,
    ApiStatus,
    DispatchOutput,
    DispatchRequest,
    Dispatcher,
    Result,
    RpcError,
    MAX_DELAY,
    MAX_PADDING_BYTES,
};

/// Caller-facing request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiRequest {
    pub run_id: Option<String>,

    /// Delivery delay in seconds, clamped to `0..=900`.
    pub delay_seconds: i64,

    /// Filler bytes in the request body; negative means none, capped at
    /// [`MAX_PADDING_BYTES`].
    pub message_body_bytes: i64,

    /// Requested wait; zero or negative selects the default.
    pub max_wait_ms: i64,
}

impl ApiRequest {
    /// Parse a request body. Blank input yields all defaults.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidInput`] if the body is not valid JSON for
    /// this shape.
    pub fn parse(body: &str) -> Result<Self> {
        // ---
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(body).map_err(|e| RpcError::InvalidInput(format!("invalid json: {e}")))
    }

    /// Normalize into dispatch parameters.
    pub fn into_dispatch_request(self) -> DispatchRequest {
        // ---
        let max_delay = MAX_DELAY.as_secs() as i64;

        DispatchRequest {
            run_id: self.run_id,
            delay: Duration::from_secs(self.delay_seconds.clamp(0, max_delay) as u64),
            padding_bytes: usize::try_from(self.message_body_bytes.max(0))
                .unwrap_or(MAX_PADDING_BYTES)
                .min(MAX_PADDING_BYTES),
            max_wait: (self.max_wait_ms > 0).then(|| Duration::from_millis(self.max_wait_ms as u64)),
        }
    }
}

/// Caller-facing response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub status: ApiStatus,

    /// Wall time of the whole call in milliseconds.
    pub total_ms: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<DispatchOutput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Rendered reply: status code, headers and JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiReply {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ApiReply {
    fn json(status_code: u16, response: &ApiResponse) -> Self {
        // ---
        let body = serde_json::to_string(response).unwrap_or_else(|e| {
            format!(r#"{{"status":"ERROR","totalMs":0,"error":"encode response: {e}"}}"#)
        });

        Self {
            status_code,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body,
        }
    }

    /// Decode the body back into an [`ApiResponse`].
    pub fn response(&self) -> Result<ApiResponse> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

impl Dispatcher {
    /// Handle one API call end to end.
    ///
    /// Never fails: every error is rendered into the reply.
    ///
    /// | outcome                         | status | `status` field |
    /// |---------------------------------|--------|----------------|
    /// | response received               | 200    | `OK`           |
    /// | body is not JSON                | 400    | `ERROR`        |
    /// | request could not be published  | 502    | `ERROR`        |
    /// | deadline passed or too close    | 504    | `TIMEOUT`      |
    /// | anything else                   | 500    | `ERROR`        |
    pub async fn handle_api(&self, body: &str, env_deadline: Option<Instant>) -> ApiReply {
        // ---
        let started = Instant::now();

        let outcome = match ApiRequest::parse(body) {
            Ok(request) => {
                self.dispatch(request.into_dispatch_request(), env_deadline)
                    .await
            }
            Err(e) => Err(e),
        };
        let total_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        match outcome {
            Ok(output) => ApiReply::json(
                200,
                &ApiResponse {
                    status: ApiStatus::Ok,
                    total_ms,
                    output: Some(output),
                    error: None,
                },
            ),
            Err(err) => {
                log_warn!("api call failed after {total_ms}ms: {err}");
                ApiReply::json(
                    err.http_status(),
                    &ApiResponse {
                        status: err.status(),
                        total_ms,
                        output: None,
                        error: Some(err.to_string()),
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn blank_body_is_all_defaults() {
        // ---
        assert_eq!(ApiRequest::parse("").unwrap(), ApiRequest::default());
        assert_eq!(ApiRequest::parse("  \n").unwrap(), ApiRequest::default());
        assert_eq!(
            ApiRequest::default().into_dispatch_request(),
            DispatchRequest::default()
        );
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        // ---
        let req = ApiRequest::parse(
            r#"{"runId":"r","delaySeconds":5000,"messageBodyBytes":-3,"maxWaitMs":-1}"#,
        )
        .unwrap()
        .into_dispatch_request();

        assert_eq!(req.run_id.as_deref(), Some("r"));
        assert_eq!(req.delay, Duration::from_secs(900));
        assert_eq!(req.padding_bytes, 0);
        assert_eq!(req.max_wait, None);

        let req = ApiRequest::parse(r#"{"delaySeconds":-4,"messageBodyBytes":16,"maxWaitMs":50}"#)
            .unwrap()
            .into_dispatch_request();
        assert_eq!(req.delay, Duration::ZERO);
        assert_eq!(req.padding_bytes, 16);
        assert_eq!(req.max_wait, Some(Duration::from_millis(50)));
    }

    #[test]
    fn oversized_padding_is_capped() {
        // ---
        let req = ApiRequest::parse(r#"{"messageBodyBytes":9223372036854775807}"#)
            .unwrap()
            .into_dispatch_request();
        assert_eq!(req.padding_bytes, MAX_PADDING_BYTES);
    }

    #[test]
    fn malformed_body_is_invalid_input() {
        // ---
        let err = ApiRequest::parse("{not json").unwrap_err();
        assert!(matches!(err, RpcError::InvalidInput(_)));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn error_response_omits_output() {
        // ---
        let reply = ApiReply::json(
            504,
            &ApiResponse {
                status: ApiStatus::Timeout,
                total_ms: 51,
                output: None,
                error: Some("timeout".into()),
            },
        );
        let json: serde_json::Value = serde_json::from_str(&reply.body).unwrap();

        assert_eq!(json["status"], "TIMEOUT");
        assert_eq!(json["totalMs"], 51);
        assert!(json.get("output").is_none());
        assert_eq!(reply.headers[0].1, "application/json");
    }
}
