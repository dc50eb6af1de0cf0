use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};
use skein_core::{EphemeralCache, RpcError};

use crate::{Batch, Call};

/// Window during which identical concurrent calls share one request.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full URL of the dispatcher route, e.g. `http://127.0.0.1:8080/rpc`.
    pub endpoint: String,
    /// Sent with every request; per-call headers override them.
    pub headers: HeaderMap,
    /// Single-flight window for calls without an explicit cache TTL. Zero disables
    /// deduplication.
    pub dedup_ttl: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        ClientConfig {
            endpoint: endpoint.into(),
            headers: HeaderMap::new(),
            dedup_ttl: DEFAULT_DEDUP_TTL,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }
}

pub(crate) struct ClientInner {
    pub config: ClientConfig,
    pub http: reqwest::Client,
    pub dedup: EphemeralCache,
}

/// Entry point for building calls against one dispatcher endpoint.
///
/// Cheap to clone; clones share the connection pool and the in-flight table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, RpcError> {
        Self::with_config(ClientConfig::new(endpoint))
    }

    pub fn with_config(config: ClientConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RpcError::from_error(&e))?;
        Ok(Self::from_parts(config, http))
    }

    /// Use an existing `reqwest` client, e.g. one with custom timeouts.
    pub fn from_parts(config: ClientConfig, http: reqwest::Client) -> Self {
        Client {
            inner: Arc::new(ClientInner {
                config,
                http,
                dedup: EphemeralCache::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Start a resource path; extend it with [`Resource::get`].
    pub fn resource(&self, name: impl Into<String>) -> Resource {
        Resource {
            client: self.clone(),
            path: name.into(),
        }
    }

    /// A call to a full dotted path.
    pub fn call(&self, path: impl Into<String>) -> Call {
        Call::new(self.clone(), path.into())
    }

    /// Start collecting calls into one batched request.
    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    pub(crate) fn inner(&self) -> Arc<ClientInner> {
        self.inner.clone()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.dedup.pending())
            .finish()
    }
}

/// A dotted resource path under construction. No I/O happens until a call is sent.
#[derive(Debug, Clone)]
pub struct Resource {
    client: Client,
    path: String,
}

impl Resource {
    /// Descend into a child segment.
    pub fn get(&self, segment: &str) -> Resource {
        Resource {
            client: self.client.clone(),
            path: format!("{}.{segment}", self.path),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Turn the path into a call.
    pub fn call(&self) -> Call {
        Call::new(self.client.clone(), self.path.clone())
    }
}
