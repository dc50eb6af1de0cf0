//! axum binding.
//!
//! Accepts `multipart/form-data` (fields `rpc` and optional `body`) and, for tooling,
//! a bare `application/json` envelope.

use axum::Router;
use axum::body::Body as HttpBody;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::response::Response;
use axum::routing::post;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use serde_json::Value;
use skein_core::{
    BODY_FIELD, Body, REQUEST_BATCH_HEADER, RPC_FIELD, ResponseType, RpcError, RpcResponse,
    header_flag,
};
use tokio::net::TcpListener;

use crate::Dispatcher;
use crate::dispatcher::with_response_type;

/// Largest JSON envelope accepted outside multipart framing.
pub const MAX_JSON_BODY: usize = 2 * 1024 * 1024;

/// A router serving `dispatcher` at `path`.
pub fn router(path: &str, dispatcher: Dispatcher) -> Router {
    Router::new()
        .route(path, post(handle))
        .with_state(dispatcher)
}

/// Serve `router` on `listener` until the server fails.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "serving rpc");
    }
    axum::serve(listener, router).await
}

pub async fn handle(State(dispatcher): State<Dispatcher>, request: Request) -> Response {
    let batch = header_flag(request.headers(), REQUEST_BATCH_HEADER);
    let response = match read_call(request).await {
        Ok((raw, payload)) => dispatcher.dispatch(&raw, payload, batch).await,
        Err(err) => with_response_type(
            dispatcher.reject(err, &Value::Null),
            ResponseType::Default,
        ),
    };
    into_http(response)
}

async fn read_call(request: Request) -> Result<(Value, Option<Bytes>), RpcError> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"));

    if !is_multipart {
        let bytes = axum::body::to_bytes(request.into_body(), MAX_JSON_BODY)
            .await
            .map_err(|e| RpcError::validation(format!("unreadable request body: {e}")))?;
        return Ok((serde_json::from_slice(&bytes)?, None));
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| RpcError::validation(e.to_string()))?;
    let mut rpc = None;
    let mut payload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RpcError::validation(e.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| RpcError::validation(e.to_string()))?;
        match name.as_deref() {
            Some(RPC_FIELD) => rpc = Some(bytes),
            Some(BODY_FIELD) => payload = Some(bytes),
            other => tracing::debug!(field = ?other, "ignoring unknown multipart field"),
        }
    }
    let rpc = rpc.ok_or_else(|| RpcError::validation("missing rpc field"))?;
    Ok((serde_json::from_slice(&rpc)?, payload))
}

/// Convert a dispatcher response into an axum response. Stream bodies stay streamed.
pub fn into_http(response: RpcResponse) -> Response {
    let (status, headers, body) = response.into_parts();
    let body = match body {
        Body::Empty => HttpBody::empty(),
        Body::Full(bytes) => HttpBody::from(bytes),
        Body::Stream(stream) => HttpBody::from_stream(stream),
    };
    let mut out = Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}
