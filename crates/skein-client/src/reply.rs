use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use skein_core::{BatchItemResult, CachedResponse, ResponseType, RpcError};

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Bytes(Bytes),
}

impl Payload {
    /// Decode a body according to its content type.
    ///
    /// JSON content types parse as JSON (an empty body is `null`), text-like types
    /// become strings, everything else stays raw bytes.
    pub fn from_parts(content_type: Option<&str>, body: Bytes) -> Result<Self, RpcError> {
        let ct = content_type.unwrap_or_default().to_ascii_lowercase();
        if ct.contains("json") {
            if body.is_empty() {
                return Ok(Payload::Json(Value::Null));
            }
            return serde_json::from_slice(&body)
                .map(Payload::Json)
                .map_err(|e| RpcError::validation(format!("malformed JSON response: {e}")));
        }
        let textual = ct.starts_with("text/") || ct.contains("xml") || ct.contains("yaml");
        if textual {
            if let Ok(text) = std::str::from_utf8(&body) {
                return Ok(Payload::Text(text.to_string()));
            }
        }
        if ct.is_empty() && body.is_empty() {
            return Ok(Payload::Json(Value::Null));
        }
        Ok(Payload::Bytes(body))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// View the payload as JSON. Text becomes a string, bytes an array of numbers.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Text(text) => Value::String(text),
            Payload::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        }
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        serde_json::from_value(self.into_json())
            .map_err(|e| RpcError::validation(format!("cannot decode response: {e}")))
    }
}

/// Status-aware view of a response, produced in `object` mode. Never an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectReply {
    pub ok: bool,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Payload,
}

/// The outcome of one invocation.
#[derive(Debug)]
pub enum Reply {
    /// `default` mode: the decoded value.
    Value(Payload),
    /// `object` mode.
    Object(ObjectReply),
    /// `response` mode: the transport response with its body read.
    Response(http::Response<Bytes>),
    /// One entry per batched call, in order.
    Batch(Vec<Result<Reply, RpcError>>),
    /// The caller aborted the call.
    Cancelled,
}

impl Reply {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Reply::Cancelled)
    }

    /// Decode the body of a single reply into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        match self {
            Reply::Value(payload) => payload.decode(),
            Reply::Object(object) => object.body.decode(),
            Reply::Response(response) => {
                let content_type = response
                    .headers()
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                Payload::from_parts(content_type.as_deref(), response.into_body())?.decode()
            }
            Reply::Batch(_) => Err(RpcError::validation(
                "batch replies must be split with into_batch",
            )),
            Reply::Cancelled => Err(RpcError::aborted()),
        }
    }

    pub fn into_batch(self) -> Result<Vec<Result<Reply, RpcError>>, RpcError> {
        match self {
            Reply::Batch(items) => Ok(items),
            Reply::Cancelled => Err(RpcError::aborted()),
            _ => Err(RpcError::validation("not a batch reply")),
        }
    }

    pub fn into_object(self) -> Result<ObjectReply, RpcError> {
        match self {
            Reply::Object(object) => Ok(object),
            Reply::Cancelled => Err(RpcError::aborted()),
            _ => Err(RpcError::validation("not an object reply")),
        }
    }

    pub fn into_response(self) -> Result<http::Response<Bytes>, RpcError> {
        match self {
            Reply::Response(response) => Ok(response),
            Reply::Cancelled => Err(RpcError::aborted()),
            _ => Err(RpcError::validation("not a response reply")),
        }
    }
}

/// Turn one materialized response into a reply for the requested mode.
///
/// Non-2xx responses are errors in `default` and `response` modes.
pub(crate) fn decode_single(
    response: CachedResponse,
    response_type: ResponseType,
) -> Result<Reply, RpcError> {
    if response_type != ResponseType::Object && !response.is_success() {
        return Err(RpcError::from_body(
            response.status.as_u16(),
            &response.body,
        ));
    }
    let content_type = response.content_type().map(str::to_owned);
    match response_type {
        ResponseType::Default => {
            let payload = Payload::from_parts(content_type.as_deref(), response.body)?;
            Ok(Reply::Value(payload))
        }
        ResponseType::Object => {
            let body = Payload::from_parts(content_type.as_deref(), response.body)?;
            Ok(Reply::Object(ObjectReply {
                ok: response.status.is_success(),
                status: response.status,
                headers: response.headers,
                body,
            }))
        }
        ResponseType::Response => {
            let mut out = http::Response::new(response.body);
            *out.status_mut() = response.status;
            *out.headers_mut() = response.headers;
            Ok(Reply::Response(out))
        }
    }
}

/// Decode a batch response body: a JSON array with one item per call.
pub(crate) fn decode_batch(response: CachedResponse) -> Result<Reply, RpcError> {
    if !response.is_success() {
        return Err(RpcError::from_body(
            response.status.as_u16(),
            &response.body,
        ));
    }
    let items: Vec<BatchItemResult> = serde_json::from_slice(&response.body)
        .map_err(|e| RpcError::validation(format!("malformed batch response: {e}")))?;
    let replies = items
        .into_iter()
        .map(|item| {
            let response_type = item.response_type;
            decode_single(item.into_response()?, response_type)
        })
        .collect();
    Ok(Reply::Batch(replies))
}
