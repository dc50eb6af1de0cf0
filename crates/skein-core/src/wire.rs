//! Transport framing shared by the dispatcher and the client.
//!
//! One HTTP `POST` per call or batch, `multipart/form-data` with:
//!
//! - field [`RPC_FIELD`]: the JSON envelope
//! - field [`BODY_FIELD`] (optional): the raw binary payload
//!
//! Batch requests carry [`REQUEST_BATCH_HEADER`]`: true`. Every response carries
//! [`RESPONSE_TYPE_HEADER`]; batch responses add [`RESPONSE_BATCH_HEADER`]`: true`
//! and a JSON array of [`BatchItemResult`].

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CachedResponse, ResponseType, RpcError};

pub const RPC_FIELD: &str = "rpc";
pub const BODY_FIELD: &str = "body";

pub const REQUEST_BATCH_HEADER: &str = "rpc-request-batch";
pub const RESPONSE_TYPE_HEADER: &str = "rpc-response-type";
pub const RESPONSE_BATCH_HEADER: &str = "rpc-response-batch";
/// Public call-context entries, serialized as a JSON object.
pub const CONTEXT_HEADER: &str = "rpc-context";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// One position of a batch response.
///
/// Two positions that shared one execution still get their own item, each tagged
/// with the response type its caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    #[serde(serialize_with = "body_to_base64", deserialize_with = "body_from_base64")]
    pub body: Bytes,
    pub content_type: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub ok: bool,
    #[serde(default)]
    pub response_type: ResponseType,
    pub status: u16,
}

impl BatchItemResult {
    pub fn from_response(response: &CachedResponse, response_type: ResponseType) -> Self {
        BatchItemResult {
            body: response.body.clone(),
            content_type: response.content_type().unwrap_or_default().to_string(),
            headers: header_map_to_btree(&response.headers),
            ok: response.status.is_success(),
            response_type,
            status: response.status.as_u16(),
        }
    }

    /// Rebuild the materialized response this item was made from.
    pub fn into_response(self) -> Result<CachedResponse, RpcError> {
        let status = StatusCode::from_u16(self.status).map_err(|_| {
            RpcError::validation(format!("invalid batch item status: {}", self.status))
        })?;
        let mut headers = btree_to_header_map(&self.headers);
        if !self.content_type.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.content_type) {
                headers.insert(http::header::CONTENT_TYPE, value);
            }
        }
        Ok(CachedResponse::new(status, headers, self.body))
    }
}

fn body_to_base64<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
}

fn body_from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

/// Flatten headers into a string map; repeated headers are joined with `", "`.
pub fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Inverse of [`header_map_to_btree`]; entries that are not valid headers are skipped.
pub fn btree_to_header_map(map: &BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(map.len());
    for (name, value) in map {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    headers
}

/// Whether a header value spells boolean true (`true`, `1`, case-insensitive).
pub fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
        .unwrap_or(false)
}
