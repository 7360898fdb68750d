//! Wire types for the WebSocket RPC surface.
//!
//! Requests are single JSON text frames `{id, method, params}`; responses
//! echo the id with `{ok, payload | error}`; server-initiated events are
//! `{event, payload}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes shared by RPC handlers and surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotLinked,
    NotPaired,
    AgentTimeout,
    InvalidRequest,
    Unavailable,
    Unauthorized,
    NotFound,
}

/// Structured error payload carried in failed responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{code:?}: {message}")]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorShape {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: None,
            retry_after_ms: None,
            details: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retryable = Some(true);
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One inbound request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, echoed verbatim in the response.
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// One outbound response frame.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseFrame {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ResponseFrame {
    pub fn ok(id: Value, payload: Value) -> Self {
        Self {
            id,
            ok: true,
            payload: Some(payload),
            error: None,
            meta: None,
        }
    }

    pub fn ok_with_meta(id: Value, payload: Value, meta: Value) -> Self {
        Self {
            meta: Some(meta),
            ..Self::ok(id, payload)
        }
    }

    pub fn err(id: Value, error: ErrorShape) -> Self {
        Self {
            id,
            ok: false,
            payload: None,
            error: Some(error),
            meta: None,
        }
    }
}

/// One broadcast event frame.
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    pub event: String,
    pub payload: Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_parses_string_and_numeric_ids() {
        let frame: RequestFrame =
            serde_json::from_str(r#"{"id": 7, "method": "health"}"#).unwrap();
        assert_eq!(frame.id, json!(7));
        assert_eq!(frame.method, "health");
        assert!(frame.params.is_none());

        let frame: RequestFrame =
            serde_json::from_str(r#"{"id": "abc", "method": "status", "params": {}}"#).unwrap();
        assert_eq!(frame.id, json!("abc"));
    }

    #[test]
    fn test_error_codes_serialize_screaming_snake() {
        let err = ErrorShape::invalid_request("bad params");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "INVALID_REQUEST");
        assert_eq!(json["message"], "bad params");
        assert!(json.get("retryAfterMs").is_none());
    }

    #[test]
    fn test_retry_after_hint_round_trips() {
        let err = ErrorShape::new(ErrorCode::InvalidRequest, "rate limited")
            .with_retry_after_ms(1500);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["retryAfterMs"], 1500);
        assert_eq!(json["retryable"], true);
        let back: ErrorShape = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_response_frame_shape() {
        let ok = ResponseFrame::ok(json!(1), json!({"status": "ok"}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json.get("error").is_none());

        let err = ResponseFrame::err(json!(1), ErrorShape::not_found("no such tenant"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }
}
