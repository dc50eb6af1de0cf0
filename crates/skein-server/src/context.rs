//! Ambient per-call scope.
//!
//! The dispatcher opens a fresh [`CallContext`] for every call and runs the call inside
//! it, so any handler code, however deeply nested, can reach it through
//! [`CallContext::current`] without threading it through parameters. Concurrent calls
//! on the same dispatcher each see only their own context.
//!
//! The scope is task-local: work moved onto a freshly spawned task must be wrapped in
//! [`CallContext::scope`] to keep seeing it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use skein_core::{CONTEXT_HEADER, CacheInterface, RpcError, RpcResponse};

tokio::task_local! {
    static CURRENT: CallContext;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    public: bool,
}

#[derive(Default)]
struct ContextState {
    entries: BTreeMap<String, Entry>,
    headers: HeaderMap,
    status: Option<StatusCode>,
}

/// Mutable key/value store plus default response metadata for one call.
///
/// Public entries are sent back to the caller in the `rpc-context` header; private
/// entries stay on the server. Cloning yields another handle to the same scope.
#[derive(Clone, Default)]
pub struct CallContext {
    state: Arc<Mutex<ContextState>>,
    cache: Option<Arc<dyn CacheInterface>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_cache(cache: Option<Arc<dyn CacheInterface>>) -> Self {
        CallContext {
            state: Arc::default(),
            cache,
        }
    }

    /// The context of the call currently executing on this task, if any.
    pub fn current() -> Option<CallContext> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }

    /// Run `fut` with this context as the ambient scope.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// The dispatcher's shared cache handle, when one is configured.
    pub fn cache(&self) -> Option<Arc<dyn CacheInterface>> {
        self.cache.clone()
    }

    /// Store a value that will be exposed to the caller.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.insert(key.into(), value.into(), true);
    }

    /// Store a value that never leaves the server.
    pub fn set_private(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.insert(key.into(), value.into(), false);
    }

    fn insert(&self, key: String, value: Value, public: bool) {
        self.state.lock().entries.insert(key, Entry { value, public });
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().entries.get(key).map(|e| e.value.clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.state.lock().entries.remove(key).map(|e| e.value)
    }

    pub fn is_public(&self, key: &str) -> Option<bool> {
        self.state.lock().entries.get(key).map(|e| e.public)
    }

    /// Change the visibility of an existing entry. Returns false if it does not exist.
    pub fn set_visibility(&self, key: &str, public: bool) -> bool {
        match self.state.lock().entries.get_mut(key) {
            Some(entry) => {
                entry.public = public;
                true
            }
            None => false,
        }
    }

    /// Public entries as a JSON object.
    pub fn public_entries(&self) -> serde_json::Map<String, Value> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.public)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Set a default response header, replacing earlier defaults with the same name.
    pub fn set_header(&self, name: &str, value: &str) -> Result<(), RpcError> {
        let (name, value) = parse_header(name, value)?;
        self.state.lock().headers.insert(name, value);
        Ok(())
    }

    /// Add a default response header alongside existing ones.
    pub fn append_header(&self, name: &str, value: &str) -> Result<(), RpcError> {
        let (name, value) = parse_header(name, value)?;
        self.state.lock().headers.append(name, value);
        Ok(())
    }

    pub fn set_status(&self, status: StatusCode) {
        self.state.lock().status = Some(status);
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.state.lock().status
    }

    /// Merge defaults into an outgoing response.
    ///
    /// Headers the response already carries win over context defaults; the default
    /// status applies only to plain `200 OK` responses. Public entries are merged into
    /// any `rpc-context` the response already carries, ours winning per key.
    pub(crate) fn apply_defaults(&self, response: &mut RpcResponse) {
        let state = self.state.lock();
        for name in state.headers.keys() {
            if response.headers().contains_key(name) {
                continue;
            }
            for value in state.headers.get_all(name) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        if let Some(status) = state.status {
            if response.status() == StatusCode::OK {
                response.set_status(status);
            }
        }
        drop(state);

        let public = self.public_entries();
        if !public.is_empty() {
            let mut merged: serde_json::Map<String, Value> = response
                .headers()
                .get(CONTEXT_HEADER)
                .and_then(|v| serde_json::from_slice(v.as_bytes()).ok())
                .unwrap_or_default();
            merged.extend(public);
            if let Ok(value) = HeaderValue::from_str(&Value::Object(merged).to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(CONTEXT_HEADER), value);
            }
        }
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), RpcError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| RpcError::internal(format!("invalid header name: {name}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| RpcError::internal(format!("invalid value for header {name}")))?;
    Ok((name, value))
}

impl Serialize for CallContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let public = self.public_entries();
        let mut map = serializer.serialize_map(Some(public.len()))?;
        for (k, v) in &public {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallContext")
            .field("entries", &state.entries)
            .field("headers", &state.headers)
            .field("status", &state.status)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_public_entries_serialize() {
        let ctx = CallContext::new();
        ctx.set("user", "ada");
        ctx.set_private("token", "s3cret");
        assert_eq!(serde_json::to_value(&ctx).unwrap(), json!({"user": "ada"}));
        assert_eq!(ctx.get("token"), Some(json!("s3cret")));

        assert!(ctx.set_visibility("token", true));
        assert_eq!(ctx.public_entries().len(), 2);
        assert!(!ctx.set_visibility("missing", true));
    }

    #[test]
    fn defaults_do_not_override_response_values() {
        let ctx = CallContext::new();
        ctx.set_header("x-default", "ctx").unwrap();
        ctx.set_header("content-type", "text/html").unwrap();
        ctx.set_status(StatusCode::CREATED);
        ctx.set("seen", true);

        let mut resp = RpcResponse::from_value(json!({"ok": true}));
        ctx.apply_defaults(&mut resp);
        assert_eq!(resp.headers().get("x-default").unwrap(), "ctx");
        assert_eq!(resp.content_type(), Some("application/json"));
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get(CONTEXT_HEADER).unwrap(), r#"{"seen":true}"#);

        let mut not_found = RpcResponse::from_error(&RpcError::not_found("x"));
        ctx.apply_defaults(&mut not_found);
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn context_entries_merge_with_a_carried_context_header() {
        let ctx = CallContext::new();
        ctx.set("user", "ada");
        let mut resp = RpcResponse::from_value(json!(1));
        resp.headers_mut().insert(
            HeaderName::from_static(CONTEXT_HEADER),
            HeaderValue::from_static(r#"{"id":7,"user":"old"}"#),
        );

        ctx.apply_defaults(&mut resp);
        let merged: Value =
            serde_json::from_slice(resp.headers()[CONTEXT_HEADER].as_bytes()).unwrap();
        assert_eq!(merged, json!({"id": 7, "user": "ada"}));

        // An empty context leaves the carried header alone.
        let mut carried = resp;
        CallContext::new().apply_defaults(&mut carried);
        assert_eq!(carried.headers()[CONTEXT_HEADER], r#"{"id":7,"user":"ada"}"#);
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let ctx = CallContext::new();
        assert!(ctx.set_header("bad header", "v").is_err());
        assert!(ctx.append_header("x-ok", "line\nbreak").is_err());
    }

    #[tokio::test]
    async fn scopes_are_isolated_per_task() {
        assert!(CallContext::current().is_none());

        let a = CallContext::new();
        let b = CallContext::new();
        let task = |ctx: CallContext, name: &'static str| {
            ctx.scope(async move {
                CallContext::current().unwrap().set("name", name);
                tokio::task::yield_now().await;
                CallContext::current().unwrap().get("name")
            })
        };
        let (seen_a, seen_b) = tokio::join!(task(a.clone(), "a"), task(b.clone(), "b"));
        assert_eq!(seen_a, Some(json!("a")));
        assert_eq!(seen_b, Some(json!("b")));
        assert_eq!(a.get("name"), Some(json!("a")));
    }
}
