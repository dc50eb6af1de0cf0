use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::AbortRegistration;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use skein_core::{BATCH_RESOURCE, Envelope, ResponseType, RpcError};

use crate::invocation::with_signal;
use crate::reply::{decode_batch, decode_single};
use crate::transport::{self, Request};
use crate::{Client, Invocation, Reply};

/// Per-call transport settings. None of these count as arguments.
#[derive(Default)]
pub struct CallOptions {
    /// Merged over the client's default headers.
    pub headers: HeaderMap,
    /// Binary payload sent in the `body` field. Not allowed inside a batch.
    pub body: Option<Bytes>,
    /// Keep the response for this long after it arrives (capped at 15s).
    pub cache_ttl: Option<Duration>,
    /// Cancels the call when aborted.
    pub signal: Option<AbortRegistration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_signal(mut self, signal: AbortRegistration) -> Self {
        self.signal = Some(signal);
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(Bytes::len))
            .field("cache_ttl", &self.cache_ttl)
            .field("signal", &self.signal.is_some())
            .finish()
    }
}

/// One call under construction.
///
/// ```ignore
/// let sum: i64 = client.call("math.add").arg(2).arg(3).send().await?.decode()?;
/// ```
#[derive(Debug)]
pub struct Call {
    client: Client,
    resource: String,
    args: Vec<Value>,
    options: CallOptions,
    response_type: ResponseType,
    error: Option<RpcError>,
}

impl Call {
    pub(crate) fn new(client: Client, resource: String) -> Self {
        Call {
            client,
            resource,
            args: Vec::new(),
            options: CallOptions::default(),
            response_type: ResponseType::Default,
            error: None,
        }
    }

    /// Append a positional argument. Serialization failures surface when the call is sent.
    pub fn arg<T: Serialize>(mut self, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => self.args.push(value),
            Err(e) => {
                let index = self.args.len();
                self.error
                    .get_or_insert_with(|| RpcError::validation(format!("argument {index}: {e}")));
            }
        }
        self
    }

    pub fn args<T: Serialize>(self, values: impl IntoIterator<Item = T>) -> Self {
        values.into_iter().fold(self, Call::arg)
    }

    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Decode into a status-aware [`ObjectReply`](crate::ObjectReply); never an error.
    pub fn as_object(mut self) -> Self {
        self.response_type = ResponseType::Object;
        self
    }

    /// Hand back the transport response itself.
    pub fn as_response(mut self) -> Self {
        self.response_type = ResponseType::Response;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::single(self.resource.clone(), self.args.clone())
            .with_response_type(self.response_type)
    }

    pub fn send(mut self) -> Invocation {
        if let Some(err) = self.error.take() {
            return Invocation::failed(err);
        }
        let envelope = self.envelope();
        let response_type = self.response_type;
        let CallOptions {
            headers,
            body,
            cache_ttl,
            signal,
        } = self.options;
        let request = Request {
            envelope,
            headers,
            payload: body,
            batch: false,
            cache_ttl,
        };
        let client = self.client.inner();
        let fut = async move {
            let response = transport::execute(client, request).await?;
            decode_single(response, response_type)
        }
        .boxed();
        Invocation::new(with_signal(fut, signal))
    }
}

/// Calls collected into one multiplexed request.
///
/// Only the batch's own options apply on the wire; a call's headers, TTL and signal
/// are ignored once it joins a batch, and a call with a payload is rejected.
#[derive(Debug)]
pub struct Batch {
    client: Client,
    calls: Vec<Call>,
    options: CallOptions,
    response_type: Option<ResponseType>,
}

impl Batch {
    pub(crate) fn new(client: Client) -> Self {
        Batch {
            client,
            calls: Vec::new(),
            options: CallOptions::default(),
            response_type: None,
        }
    }

    pub fn add(mut self, call: Call) -> Self {
        self.calls.push(call);
        self
    }

    pub fn push(&mut self, call: Call) {
        self.calls.push(call);
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Decode every item that did not pick a mode itself as an object.
    pub fn as_object(mut self) -> Self {
        self.response_type = Some(ResponseType::Object);
        self
    }

    /// Decode every item that did not pick a mode itself as a response.
    pub fn as_response(mut self) -> Self {
        self.response_type = Some(ResponseType::Response);
        self
    }

    fn envelope(&self) -> Result<Envelope, RpcError> {
        if self.options.body.is_some() {
            return Err(RpcError::validation("a batch cannot carry a payload"));
        }
        let mut items = Vec::with_capacity(self.calls.len());
        for (position, call) in self.calls.iter().enumerate() {
            if let Some(err) = &call.error {
                return Err(err.clone().with_context("position", position));
            }
            if call.options.body.is_some() {
                return Err(RpcError::validation("a batched call cannot carry a payload")
                    .with_context("position", position));
            }
            if call.resource == BATCH_RESOURCE {
                return Err(RpcError::validation("batches cannot be nested")
                    .with_context("position", position));
            }
            let mut envelope = call.envelope();
            if let Some(mode) = self.response_type {
                if envelope.response_type == ResponseType::Default {
                    envelope.response_type = mode;
                }
            }
            items.push(envelope);
        }
        let mut batch = Envelope::batch(items);
        batch.response_type = self.response_type.unwrap_or_default();
        Ok(batch)
    }

    pub fn send(self) -> Invocation {
        let envelope = match self.envelope() {
            Ok(envelope) => envelope,
            Err(err) => return Invocation::failed(err),
        };
        let CallOptions {
            headers,
            cache_ttl,
            signal,
            ..
        } = self.options;
        if envelope.args.is_empty() {
            return Invocation::new(with_signal(
                async { Ok(Reply::Batch(Vec::new())) }.boxed(),
                signal,
            ));
        }
        let request = Request {
            envelope,
            headers,
            payload: None,
            batch: true,
            cache_ttl,
        };
        let client = self.client.inner();
        let fut = async move {
            let response = transport::execute(client, request).await?;
            decode_batch(response)
        }
        .boxed();
        Invocation::new(with_signal(fut, signal))
    }
}
