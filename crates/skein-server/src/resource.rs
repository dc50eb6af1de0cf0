//! Startup-time resource registry.
//!
//! A [`Namespace`] maps names to handlers and to nested namespaces. Dotted resource
//! paths (`"math.add"`) walk the tree from the root; every namespace on the way
//! contributes its hooks to the call, outermost first.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use skein_core::{Envelope, RpcError, RpcResponse};

use crate::DispatcherConfig;

/// Positional arguments of one call, plus its optional binary payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Vec<Value>,
    payload: Option<Bytes>,
}

impl Args {
    pub fn new(values: Vec<Value>, payload: Option<Bytes>) -> Self {
        Args { values, payload }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Decode the argument at `index`. A missing argument decodes from `null`, so
    /// `Option<T>` parameters may be omitted by the caller.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self.values.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            RpcError::validation(format!("argument {index}: {e}")).with_context("argument", index)
        })
    }

    /// Decode the whole argument list, typically into a tuple.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_value(Value::Array(self.values.clone()))
            .map_err(|e| RpcError::validation(format!("arguments: {e}")))
    }

    /// The binary payload sent alongside the envelope, if any.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }
}

/// A callable resource.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, args: Args) -> BoxFuture<'static, Result<RpcResponse, RpcError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcResponse, RpcError>> + Send + 'static,
{
    fn call(&self, args: Args) -> BoxFuture<'static, Result<RpcResponse, RpcError>> {
        (self)(args).boxed()
    }
}

/// Runs before a handler; may replace the inbound envelope.
pub type BeforeHook =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<Envelope, RpcError>> + Send + Sync>;

/// Runs after a handler; may replace the outgoing response.
pub type AfterHook =
    Arc<dyn Fn(RpcResponse) -> BoxFuture<'static, Result<RpcResponse, RpcError>> + Send + Sync>;

/// A named group of handlers and nested namespaces.
#[derive(Clone, Default)]
pub struct Namespace {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
    children: BTreeMap<String, Namespace>,
    before: Vec<BeforeHook>,
    after: Vec<AfterHook>,
}

/// A handler together with the hooks of every namespace from the root to its owner.
#[derive(Clone)]
pub struct Resolved {
    pub handler: Arc<dyn Handler>,
    pub before: Vec<BeforeHook>,
    pub after: Vec<AfterHook>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register any [`Handler`] implementation.
    pub fn register(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register a handler returning a full [`RpcResponse`].
    pub fn handler<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcResponse, RpcError>> + Send + 'static,
    {
        self.register(name, f)
    }

    /// Register a handler returning any serializable value.
    ///
    /// Strings go out as plain text, everything else as JSON.
    pub fn method<F, Fut, T>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.handler(name, move |args: Args| {
            let fut = f(args);
            async move {
                let value = fut.await?;
                RpcResponse::from_serialize(&value)
            }
        })
    }

    pub fn nest(mut self, name: impl Into<String>, child: Namespace) -> Self {
        self.children.insert(name.into(), child);
        self
    }

    pub fn on_before_request<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Envelope, RpcError>> + Send + 'static,
    {
        self.before.push(Arc::new(move |env| hook(env).boxed()));
        self
    }

    pub fn on_after_response<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RpcResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcResponse, RpcError>> + Send + 'static,
    {
        self.after.push(Arc::new(move |resp| hook(resp).boxed()));
        self
    }

    /// Resolve a dotted path the way the dispatcher does.
    ///
    /// Returns `None` for empty segments, for any segment carrying a private prefix,
    /// and for paths that do not end at a registered handler.
    pub fn resolve(&self, path: &str, config: &DispatcherConfig) -> Option<Resolved> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let name = segments.pop()?;
        if segments
            .iter()
            .chain(std::iter::once(&name))
            .any(|s| s.is_empty() || config.is_private(s))
        {
            return None;
        }

        let mut before = self.before.clone();
        let mut after = self.after.clone();
        let mut current = self;
        for segment in segments {
            current = current.children.get(segment)?;
            before.extend(current.before.iter().cloned());
            after.extend(current.after.iter().cloned());
        }
        let handler = current.handlers.get(name)?.clone();
        Some(Resolved {
            handler,
            before,
            after,
        })
    }

    /// Find a handler by path without any privacy or reserved-name checks.
    ///
    /// Lets tests reach private handlers directly; the dispatcher never calls it.
    pub fn lookup(&self, path: &str) -> Option<Arc<dyn Handler>> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let name = segments.pop()?;
        let mut current = self;
        for segment in segments {
            current = current.children.get(segment)?;
        }
        current.handlers.get(name).cloned()
    }

    /// Every registered handler path, private ones included. Handlers of a namespace
    /// come before those of its children.
    pub fn resources(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for name in self.handlers.keys() {
            out.push(format!("{prefix}{name}"));
        }
        for (name, child) in &self.children {
            child.collect_paths(&format!("{prefix}{name}."), out);
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("children", &self.children)
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}
