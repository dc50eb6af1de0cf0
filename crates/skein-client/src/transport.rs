//! One multipart `POST` per call or batch, with in-flight deduplication.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use skein_core::{
    BODY_FIELD, CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM, CachePolicy, CachedResponse,
    Envelope, Produced, REQUEST_BATCH_HEADER, RPC_FIELD, RpcError, WrapOptions, canonical_json,
    hash_key, header_map_to_btree,
};

use crate::client::ClientInner;

/// Everything needed to put one request on the wire.
pub(crate) struct Request {
    pub envelope: Envelope,
    pub headers: HeaderMap,
    pub payload: Option<Bytes>,
    pub batch: bool,
    pub cache_ttl: Option<Duration>,
}

impl Request {
    /// Identical requests share one in-flight exchange; the key covers the endpoint,
    /// the envelope and the per-request headers.
    fn dedup_key(&self, endpoint: &str) -> String {
        let headers = serde_json::to_value(header_map_to_btree(&self.headers)).unwrap_or_default();
        let material = format!(
            "{endpoint}\n{}\n{}",
            canonical_json(&self.envelope.to_value()),
            canonical_json(&headers)
        );
        hash_key(material.as_bytes())
    }
}

/// Send `request`, sharing the exchange with identical concurrent requests.
///
/// Requests carrying a payload always go out on their own. A response is kept
/// after completion only when the caller asked for a cache TTL.
pub(crate) async fn execute(
    client: Arc<ClientInner>,
    request: Request,
) -> Result<CachedResponse, RpcError> {
    if request.payload.is_some() {
        return post(&client, request).await;
    }

    let key = request.dedup_key(&client.config.endpoint);
    let ttl = request.cache_ttl.unwrap_or(client.config.dedup_ttl);
    let persist = request.cache_ttl.is_some();
    let dedup = client.dedup.clone();
    let producer = move || async move {
        let response = post(&client, request).await?;
        Ok::<_, RpcError>(if persist {
            Produced {
                response,
                policy: Some(CachePolicy::with_ttl(ttl)),
            }
        } else {
            Produced::transient(response)
        })
    };
    dedup.wrap(&key, producer, WrapOptions::ttl(ttl)).await
}

async fn post(client: &ClientInner, request: Request) -> Result<CachedResponse, RpcError> {
    let rpc = request.envelope.to_value().to_string();
    let mut form = Form::new().part(
        RPC_FIELD,
        Part::text(rpc)
            .mime_str(CONTENT_TYPE_JSON)
            .map_err(transport_error)?,
    );
    if let Some(payload) = request.payload {
        form = form.part(
            BODY_FIELD,
            Part::bytes(payload.to_vec())
                .file_name(BODY_FIELD)
                .mime_str(CONTENT_TYPE_OCTET_STREAM)
                .map_err(transport_error)?,
        );
    }

    let mut headers = client.config.headers.clone();
    for (name, value) in &request.headers {
        headers.insert(name.clone(), value.clone());
    }
    if request.batch {
        headers.insert(REQUEST_BATCH_HEADER, HeaderValue::from_static("true"));
    }

    tracing::debug!(
        resource = %request.envelope.resource,
        batch = request.batch,
        endpoint = %client.config.endpoint,
        "sending rpc request"
    );
    let response = client
        .http
        .post(&client.config.endpoint)
        .headers(headers)
        .multipart(form)
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(transport_error)?;
    Ok(CachedResponse::new(status, headers, body))
}

fn transport_error(err: reqwest::Error) -> RpcError {
    let detail = RpcError::from_error(&err).detail;
    let mut out = RpcError::transport(err.to_string());
    out.detail = detail;
    out
}
