//! Call dispatch.
//!
//! A single call moves through
//! validate → resolve → before hooks → cache → execute → after hooks → emit.
//! A batch validates each item on its own, executes every structurally distinct item
//! once and hands the result to each position that asked for it.
//!
//! Nothing escapes [`Dispatcher::dispatch`] as an error: every failure is normalized
//! into an [`RpcError`] and rendered as a response.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::join_all;
use http::{HeaderName, HeaderValue};
use serde_json::Value;
use skein_core::{
    BatchItemResult, Body, CacheDirective, CacheInterface, CachedResponse, Envelope, Produced,
    RESPONSE_BATCH_HEADER, RESPONSE_TYPE_HEADER, ResponseType, RpcError, RpcResponse, WrapOptions,
    structural_key,
};

use crate::{Args, CallContext, DispatcherConfig, Handler, Namespace};

/// Rewrites an error before it leaves the dispatcher. Receives the raw envelope.
pub type ErrorTransform = Arc<dyn Fn(RpcError, &Value) -> RpcError + Send + Sync>;

struct DispatcherInner {
    root: Namespace,
    config: DispatcherConfig,
    cache: Option<Arc<dyn CacheInterface>>,
    transform: Option<ErrorTransform>,
}

/// Serves calls against a [`Namespace`] tree. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

pub struct DispatcherBuilder {
    root: Namespace,
    config: DispatcherConfig,
    cache: Option<Arc<dyn CacheInterface>>,
    transform: Option<ErrorTransform>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Route every call through `cache`.
    pub fn cache(mut self, cache: impl CacheInterface) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn shared_cache(mut self, cache: Arc<dyn CacheInterface>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn error_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(RpcError, &Value) -> RpcError + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                root: self.root,
                config: self.config,
                cache: self.cache,
                transform: self.transform,
            }),
        }
    }
}

impl Dispatcher {
    pub fn new(root: Namespace) -> Self {
        Self::builder(root).build()
    }

    pub fn builder(root: Namespace) -> DispatcherBuilder {
        DispatcherBuilder {
            root,
            config: DispatcherConfig::default(),
            cache: None,
            transform: None,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.root
    }

    /// Every path a caller can reach: private and reserved names are left out.
    pub fn resources(&self) -> Vec<String> {
        let config = &self.inner.config;
        self.inner
            .root
            .resources()
            .into_iter()
            .filter(|path| !config.is_reserved(path))
            .filter(|path| path.split('.').all(|s| !config.is_private(s)))
            .collect()
    }

    /// Entry point for one transport request.
    ///
    /// Batches are recognized by the transport's batch flag or by `batch: true` in
    /// the envelope; a payload is only accepted on single calls.
    pub async fn dispatch(&self, raw: &Value, payload: Option<Bytes>, batch: bool) -> RpcResponse {
        let is_batch = batch || raw.get("batch").and_then(Value::as_bool) == Some(true);
        if !is_batch {
            return self.call(raw, payload).await;
        }
        if payload.is_some() {
            let err = RpcError::validation("a batch request cannot carry a payload");
            return with_response_type(self.reject(err, raw), requested_response_type(raw));
        }
        self.call_many(raw).await
    }

    /// Execute a single call.
    pub async fn call(&self, raw: &Value, payload: Option<Bytes>) -> RpcResponse {
        let ctx = CallContext::with_cache(self.inner.cache.clone());
        let outcome = AssertUnwindSafe(ctx.clone().scope(self.execute(raw, payload, &ctx)))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)));

        let (mut response, response_type) = match outcome {
            Ok(done) => done,
            Err(err) => (self.reject(err, raw), requested_response_type(raw)),
        };
        // Idempotent for a response a cached producer already shaped with this context.
        ctx.apply_defaults(&mut response);
        with_response_type(response, response_type)
    }

    async fn execute(
        &self,
        raw: &Value,
        payload: Option<Bytes>,
        ctx: &CallContext,
    ) -> Result<(RpcResponse, ResponseType), RpcError> {
        let mut env = Envelope::from_value(raw)?;
        if env.batch {
            return Err(RpcError::validation(
                "batch envelopes must be sent as a batch request",
            ));
        }
        tracing::debug!(resource = %env.resource, args = env.args.len(), "dispatching call");

        let config = &self.inner.config;
        if config.is_reserved(&env.resource) {
            tracing::debug!(resource = %env.resource, "reserved resource name");
            return Err(RpcError::not_found(&env.resource));
        }
        let Some(resolved) = self.inner.root.resolve(&env.resource, config) else {
            tracing::debug!(resource = %env.resource, "resource did not resolve");
            return Err(RpcError::not_found(&env.resource));
        };

        for hook in &resolved.before {
            env = hook(env).await?;
        }
        let mut response = self
            .try_cached(&env, resolved.handler, payload, ctx)
            .await?;
        for hook in &resolved.after {
            response = hook(response).await?;
        }
        Ok((response, env.response_type))
    }

    /// Run the handler through the configured cache, or directly without one.
    ///
    /// The producer runs inside the originating call's context and applies its defaults
    /// before the response is shared, so joiners and later hits get the same status,
    /// headers and `rpc-context`. Calls with a payload skip the cache: the payload is
    /// not part of the key.
    async fn try_cached(
        &self,
        env: &Envelope,
        handler: Arc<dyn Handler>,
        payload: Option<Bytes>,
        ctx: &CallContext,
    ) -> Result<RpcResponse, RpcError> {
        let cache = match &self.inner.cache {
            Some(cache) if payload.is_none() => cache,
            _ => return invoke(handler, Args::new(env.args.clone(), payload)).await,
        };

        let key = format!("rpc:{}", structural_key(&env.resource, &env.args));
        let args = Args::new(env.args.clone(), None);
        let scope = ctx.clone();
        let producer = async move {
            let mut response = scope.clone().scope(invoke(handler, args)).await?;
            scope.apply_defaults(&mut response);
            let policy = response.cache_directive().and_then(CacheDirective::policy);
            let response = response.materialize().await?;
            Ok(Produced { response, policy })
        }
        .boxed();

        let opts = WrapOptions::ttl(self.inner.config.cache_ttl);
        let cached = cache.wrap(key, producer, opts).await?;
        Ok(RpcResponse::from_cached(cached))
    }

    /// Execute a batch envelope.
    pub async fn call_many(&self, raw: &Value) -> RpcResponse {
        let response_type = requested_response_type(raw);
        let response = match self.execute_batch(raw).await {
            Ok(response) => response,
            Err(err) => self.reject(err, raw),
        };
        with_response_type(response, response_type)
    }

    async fn execute_batch(&self, raw: &Value) -> Result<RpcResponse, RpcError> {
        let outer = Envelope::from_value(raw)?;
        if !outer.batch {
            return Err(RpcError::validation("batch request must set batch: true"));
        }
        let max = self.inner.config.max_batch_size;
        if outer.args.len() > max {
            return Err(RpcError::validation(format!(
                "batch of {} items exceeds the limit of {max}",
                outer.args.len()
            ))
            .with_context("limit", max));
        }

        let items = outer.batch_items();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<&Envelope> = Vec::new();
        let mut slots = Vec::with_capacity(items.len());
        for item in &items {
            let key = structural_key(&item.resource, &item.args);
            let slot = *index.entry(key).or_insert_with(|| {
                unique.push(item);
                unique.len() - 1
            });
            slots.push(slot);
        }
        tracing::debug!(
            received = outer.args.len(),
            valid = items.len(),
            unique = unique.len(),
            "executing batch"
        );

        let results = join_all(unique.iter().map(|env| self.execute_item(env))).await;
        let body: Vec<BatchItemResult> = items
            .iter()
            .zip(&slots)
            .map(|(item, &slot)| BatchItemResult::from_response(&results[slot], item.response_type))
            .collect();

        let mut response = RpcResponse::json_value(&serde_json::to_value(&body)?);
        response.headers_mut().insert(
            HeaderName::from_static(RESPONSE_BATCH_HEADER),
            HeaderValue::from_static("true"),
        );
        Ok(response)
    }

    /// One batch item runs as its own call, with its own context.
    async fn execute_item(&self, env: &Envelope) -> CachedResponse {
        let raw = env.to_value();
        match self.call(&raw, None).await.materialize().await {
            Ok(cached) => cached,
            Err(err) => error_response(self.normalize(err, &raw)),
        }
    }

    /// Normalize an error and render it as a response.
    pub fn reject(&self, err: RpcError, raw: &Value) -> RpcResponse {
        RpcResponse::from_error(&self.normalize(err, raw))
    }

    fn normalize(&self, err: RpcError, raw: &Value) -> RpcError {
        let mut err = match &self.inner.transform {
            Some(transform) => transform(err, raw),
            None => err,
        };
        err.context
            .entry("envelope")
            .or_insert_with(|| raw.clone());
        if err.status >= 500 {
            tracing::warn!(status = err.status, message = %err.message, detail = ?err.detail, "call failed");
        } else {
            tracing::debug!(status = err.status, message = %err.message, "call rejected");
        }
        if !self.inner.config.expose_error_detail {
            err.detail = None;
        }
        err
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("root", &self.inner.root)
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache.is_some())
            .finish()
    }
}

async fn invoke(handler: Arc<dyn Handler>, args: Args) -> Result<RpcResponse, RpcError> {
    AssertUnwindSafe(async move { handler.call(args).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_error(panic)))
}

fn panic_error(panic: Box<dyn Any + Send>) -> RpcError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    RpcError::internal("handler panicked").with_detail(message)
}

fn requested_response_type(raw: &Value) -> ResponseType {
    raw.get("responseType")
        .and_then(Value::as_str)
        .and_then(ResponseType::parse)
        .unwrap_or_default()
}

pub(crate) fn with_response_type(
    mut response: RpcResponse,
    response_type: ResponseType,
) -> RpcResponse {
    response.headers_mut().insert(
        HeaderName::from_static(RESPONSE_TYPE_HEADER),
        HeaderValue::from_static(response_type.as_str()),
    );
    response
}

fn error_response(err: RpcError) -> CachedResponse {
    let (status, headers, body) = RpcResponse::from_error(&err).into_parts();
    let body = match body {
        Body::Full(bytes) => bytes,
        _ => Bytes::new(),
    };
    CachedResponse::new(status, headers, body)
}
