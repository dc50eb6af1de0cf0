//! The response envelope a handler produces.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::{
    CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM, CONTENT_TYPE_TEXT, CachedResponse, RpcError,
    hash_key,
};

/// How the dispatcher may cache a response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheDirective {
    /// Do not cache (`false`).
    #[default]
    Skip,
    /// Cache with the dispatcher's default policy (`true`).
    Default,
    /// Cache with explicit tags and TTL.
    Policy {
        tags: Vec<String>,
        ttl: Option<Duration>,
    },
}

impl CacheDirective {
    pub fn ttl(ttl: Duration) -> Self {
        CacheDirective::Policy {
            tags: Vec::new(),
            ttl: Some(ttl),
        }
    }

    pub fn tagged(tags: impl IntoIterator<Item = impl Into<String>>, ttl: Option<Duration>) -> Self {
        CacheDirective::Policy {
            tags: tags.into_iter().map(Into::into).collect(),
            ttl,
        }
    }

    /// The persistence policy this directive asks for, if any.
    pub fn policy(&self) -> Option<CachePolicy> {
        match self {
            CacheDirective::Skip => None,
            CacheDirective::Default => Some(CachePolicy::default()),
            CacheDirective::Policy { tags, ttl } => Some(CachePolicy {
                tags: tags.clone(),
                ttl: *ttl,
            }),
        }
    }
}

impl From<bool> for CacheDirective {
    fn from(cache: bool) -> Self {
        if cache {
            CacheDirective::Default
        } else {
            CacheDirective::Skip
        }
    }
}

/// Persistence policy attached to a produced response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachePolicy {
    pub tags: Vec<String>,
    /// Overrides the TTL the cache was asked to use.
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub fn with_ttl(ttl: Duration) -> Self {
        CachePolicy {
            tags: Vec::new(),
            ttl: Some(ttl),
        }
    }
}

/// Response body. Stream bodies can be read exactly once.
pub enum Body {
    Empty,
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, RpcError>>),
}

impl Body {
    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// Read the whole body into memory.
    pub async fn collect(self) -> Result<Bytes, RpcError> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.put(chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream(_) => write!(f, "Body::Stream(..)"),
        }
    }
}

/// An HTTP-response-shaped value produced by one call execution.
///
/// Content type is inferred from the wrapped value; the optional cache directive is
/// read only by the dispatcher and never reaches the wire.
#[derive(Debug)]
pub struct RpcResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    cache: Option<CacheDirective>,
}

impl RpcResponse {
    pub fn new(body: Body, content_type: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        RpcResponse {
            status: StatusCode::OK,
            headers,
            body,
            cache: None,
        }
    }

    /// Wrap a JSON value, inferring the content type from its shape.
    ///
    /// Strings become `text/plain`; arrays, objects, booleans, numbers and `null` become JSON.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::text(text),
            other => Self::json_value(&other),
        }
    }

    /// Serialize any value and wrap it with inferred content type.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, RpcError> {
        let value = serde_json::to_value(value)
            .map_err(|e| RpcError::from_error(&e).with_context("stage", "serialize"))?;
        Ok(Self::from_value(value))
    }

    /// Always JSON, even for strings.
    pub fn json_value(value: &Value) -> Self {
        Self::new(
            Body::Full(Bytes::from(value.to_string())),
            CONTENT_TYPE_JSON,
        )
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Body::Full(Bytes::from(text.into())), CONTENT_TYPE_TEXT)
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(Body::Full(bytes.into()), CONTENT_TYPE_OCTET_STREAM)
    }

    pub fn stream(stream: BoxStream<'static, Result<Bytes, RpcError>>) -> Self {
        Self::new(Body::Stream(stream), CONTENT_TYPE_OCTET_STREAM)
    }

    pub fn empty() -> Self {
        RpcResponse {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: Body::Empty,
            cache: None,
        }
    }

    /// Encode form-shaped fields as `multipart/form-data`.
    pub fn form<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let fields: Vec<(K, V)> = fields.into_iter().collect();
        let mut material = Vec::new();
        for (name, value) in &fields {
            material.extend_from_slice(name.as_ref().as_bytes());
            material.extend_from_slice(value.as_ref());
        }
        let boundary = format!("skein-{}", &hash_key(&material)[..32]);

        let mut buf = BytesMut::new();
        for (name, value) in &fields {
            buf.put_slice(format!("--{boundary}\r\n").as_bytes());
            buf.put_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    name.as_ref().replace('"', "%22")
                )
                .as_bytes(),
            );
            buf.put_slice(value.as_ref());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(format!("--{boundary}--\r\n").as_bytes());

        let mut this = Self::new(Body::Full(buf.freeze()), CONTENT_TYPE_OCTET_STREAM);
        if let Ok(value) = HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
        {
            this.headers.insert(CONTENT_TYPE, value);
        }
        this
    }

    /// Response for a normalized error: JSON body, error status, error headers.
    pub fn from_error(err: &RpcError) -> Self {
        let mut this = Self::new(
            Body::Full(Bytes::from(err.to_json_bytes())),
            CONTENT_TYPE_JSON,
        );
        this.status =
            StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        for (name, value) in &err.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                this.headers.insert(name, value);
            }
        }
        this
    }

    pub fn from_cached(cached: CachedResponse) -> Self {
        RpcResponse {
            status: cached.status,
            headers: cached.headers,
            body: Body::Full(cached.body),
            cache: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_cache(mut self, directive: impl Into<CacheDirective>) -> Self {
        self.cache = Some(directive.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn cache_directive(&self) -> Option<&CacheDirective> {
        self.cache.as_ref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Body) {
        (self.status, self.headers, self.body)
    }

    /// Read the body into memory so the response can be shared and read many times.
    pub async fn materialize(self) -> Result<CachedResponse, RpcError> {
        let body = self.body.collect().await?;
        Ok(CachedResponse::new(self.status, self.headers, body))
    }
}

impl From<Value> for RpcResponse {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl From<String> for RpcResponse {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&str> for RpcResponse {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<Bytes> for RpcResponse {
    fn from(bytes: Bytes) -> Self {
        Self::bytes(bytes)
    }
}

impl From<Vec<u8>> for RpcResponse {
    fn from(bytes: Vec<u8>) -> Self {
        Self::bytes(bytes)
    }
}
