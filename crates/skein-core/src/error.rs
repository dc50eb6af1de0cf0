//! The normalized error carried across every skein boundary.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status used for a caller-initiated graceful abort ("client closed request").
pub const ABORT_STATUS: u16 = 499;

/// Status used when the transport itself failed before a response arrived.
pub const TRANSPORT_FAILURE_STATUS: u16 = 503;

/// Broad classification of an [`RpcError`], derived from its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed envelope or arguments (400)
    Validation,
    /// Unresolvable or disallowed resource (404)
    NotFound,
    /// Cancelled by the caller
    Aborted,
    /// The transport failed before a response was received
    Transport,
    /// Anything a handler (or the machinery around it) produced
    Handler,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Aborted => write!(f, "aborted"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Handler => write!(f, "handler"),
        }
    }
}

/// Normalized RPC error.
///
/// This is the single error shape that crosses the wire: the dispatcher turns every
/// failure into one before it leaves the dispatch entry point, and the client parses
/// non-2xx bodies back into one.
///
/// `context` is machine-readable and always carries the originating call envelope
/// under the `"envelope"` key once the dispatcher has normalized the error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub status: u16,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Source chain of the underlying failure. Stripped unless detail is explicitly exposed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RpcError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        RpcError {
            status,
            message: message.into(),
            context: Map::new(),
            headers: BTreeMap::new(),
            detail: None,
        }
    }

    /// Malformed envelope, arguments or builder misuse.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// The resource does not resolve to a callable handler.
    ///
    /// Missing, private and reserved resources all produce the same error.
    pub fn not_found(resource: &str) -> Self {
        Self::new(404, "resource not found").with_context("resource", resource)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn aborted() -> Self {
        Self::new(ABORT_STATUS, "call aborted")
    }

    /// The request never produced a response (connect failure, reset, bad URL).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(TRANSPORT_FAILURE_STATUS, message).with_context("transport", true)
    }

    /// Wrap an arbitrary error as a 500, recording its source chain in `detail`.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let mut detail = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            detail.push_str("\ncaused by: ");
            detail.push_str(&cause.to_string());
            source = cause.source();
        }
        let mut this = Self::internal(err.to_string());
        this.detail = Some(detail);
        this
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self.status {
            400 => ErrorKind::Validation,
            404 => ErrorKind::NotFound,
            ABORT_STATUS => ErrorKind::Aborted,
            TRANSPORT_FAILURE_STATUS if self.context.contains_key("transport") => {
                ErrorKind::Transport
            }
            _ => ErrorKind::Handler,
        }
    }

    pub fn is_abort(&self) -> bool {
        self.status == ABORT_STATUS
    }

    /// The envelope recorded by the dispatcher, if any.
    pub fn envelope(&self) -> Option<&Value> {
        self.context.get("envelope")
    }

    /// Serialize to the JSON body sent on the wire.
    pub fn to_json_bytes(&self) -> Vec<u8> {
        // A struct of strings and JSON values cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec())
    }

    /// Parse an error body; falls back to the raw text as message.
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        match serde_json::from_slice::<RpcError>(body) {
            Ok(mut err) => {
                err.status = status;
                err
            }
            Err(_) => {
                let text = String::from_utf8_lossy(body).trim().to_string();
                let message = if text.is_empty() {
                    http::StatusCode::from_u16(status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("request failed")
                        .to_string()
                } else {
                    text
                };
                Self::new(status, message)
            }
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.status, self.kind(), self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::validation(format!("invalid JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_status() {
        assert_eq!(RpcError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(RpcError::not_found("a.b").kind(), ErrorKind::NotFound);
        assert_eq!(RpcError::aborted().kind(), ErrorKind::Aborted);
        assert_eq!(RpcError::internal("boom").kind(), ErrorKind::Handler);
        assert_eq!(RpcError::new(418, "teapot").kind(), ErrorKind::Handler);
        assert!(RpcError::aborted().is_abort());
    }

    #[test]
    fn body_round_trip_keeps_context() {
        let err = RpcError::not_found("math.nope")
            .with_context("envelope", serde_json::json!({"resource": "math.nope"}))
            .with_header("x-trace", "abc");
        let parsed = RpcError::from_body(404, &err.to_json_bytes());
        assert_eq!(parsed, err);
        assert_eq!(
            parsed.envelope().and_then(|e| e.get("resource")),
            Some(&Value::from("math.nope"))
        );
    }

    #[test]
    fn from_body_falls_back_to_text() {
        let err = RpcError::from_body(502, b"upstream exploded");
        assert_eq!(err.status, 502);
        assert_eq!(err.message, "upstream exploded");

        let err = RpcError::from_body(503, b"");
        assert_eq!(err.message, "Service Unavailable");
    }

    #[test]
    fn from_error_records_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = RpcError::from_error(&io);
        assert_eq!(err.status, 500);
        assert!(err.detail.as_deref().unwrap().contains("disk on fire"));
    }

    #[test]
    fn display_mentions_status_and_kind() {
        let s = RpcError::validation("args must be an array").to_string();
        assert!(s.contains("400"));
        assert!(s.contains("validation"));
        assert!(s.contains("args must be an array"));
    }
}
