//! Short-lived response memo with single-flight coordination.
//!
//! [`EphemeralCache`] keeps materialized responses for at most [`MAX_TTL`] and makes
//! sure that concurrent producers for the same key run exactly once: the first caller
//! registers a pending slot, later callers await that slot and each receive their own
//! copy of the result. A failed producer is observed identically by every waiter and
//! never leaves an entry behind. When the last waiter of a slot goes away the slot is
//! retired and its producer dropped, so a later caller starts over.
//!
//! Entries hold bytes, never live streams, so every read gets a fresh view.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{CachePolicy, RpcError};

/// Hard upper bound on any entry's lifetime.
pub const MAX_TTL: Duration = Duration::from_secs(15);

/// A response read fully into memory.
///
/// Cloning is cheap and every clone reads the body independently.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        CachedResponse {
            status,
            headers,
            body,
        }
    }

    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// What a producer hands back to [`EphemeralCache::wrap`].
#[derive(Debug, Clone)]
pub struct Produced {
    pub response: CachedResponse,
    /// `None` means "share with concurrent waiters, but do not persist".
    pub policy: Option<CachePolicy>,
}

impl Produced {
    /// A result that may be persisted with the caller's TTL.
    pub fn cacheable(response: CachedResponse) -> Self {
        Produced {
            response,
            policy: Some(CachePolicy::default()),
        }
    }

    /// A result that is shared with concurrent waiters only.
    pub fn transient(response: CachedResponse) -> Self {
        Produced {
            response,
            policy: None,
        }
    }
}

/// Options for [`EphemeralCache::wrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapOptions {
    /// Zero disables both caching and single-flight.
    pub ttl: Duration,
    /// Restart the TTL of an entry when it is served.
    pub refresh_ttl: bool,
}

impl WrapOptions {
    pub fn ttl(ttl: Duration) -> Self {
        WrapOptions {
            ttl,
            refresh_ttl: false,
        }
    }

    pub fn refreshing(mut self) -> Self {
        self.refresh_ttl = true;
        self
    }
}

/// Errors returned by direct cache writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is empty after trimming.
    InvalidKey,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::InvalidKey => write!(f, "cache key must not be empty"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<CacheError> for RpcError {
    fn from(err: CacheError) -> Self {
        RpcError::from_error(&err)
    }
}

/// Pluggable cache consumed by the dispatcher.
///
/// [`EphemeralCache`] is the reference implementation; hosts may supply their own.
pub trait CacheInterface: Send + Sync + 'static {
    /// Serve `key` from cache, join an in-flight producer, or run `producer`.
    fn wrap(
        &self,
        key: String,
        producer: BoxFuture<'static, Result<Produced, RpcError>>,
        opts: WrapOptions,
    ) -> BoxFuture<'_, Result<CachedResponse, RpcError>>;

    /// Store a response directly.
    fn set(&self, key: &str, response: CachedResponse, policy: CachePolicy) -> Result<(), RpcError>;
}

type PendingFuture = Shared<BoxFuture<'static, Result<CachedResponse, RpcError>>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    stored_at: Instant,
    ttl: Duration,
    tags: Vec<String>,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant, ttl_override: Option<Duration>) -> bool {
        let ttl = ttl_override.map(clamp_ttl).unwrap_or(self.ttl);
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

struct PendingSlot {
    id: u64,
    future: PendingFuture,
    waiters: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingSlot>,
    next_slot: u64,
}

impl CacheState {
    /// Fresh entry for `key`, judged by `ttl_override` when given. Only an entry that is
    /// also stale under its own TTL is evicted on the way.
    fn fresh_entry(
        &mut self,
        key: &str,
        now: Instant,
        ttl_override: Option<Duration>,
    ) -> Option<&mut CacheEntry> {
        let entry = self.entries.get(key)?;
        if entry.is_fresh(now, ttl_override) {
            return self.entries.get_mut(key);
        }
        if !entry.is_fresh(now, None) {
            self.entries.remove(key);
        }
        None
    }

    /// Remove the pending slot for `key` if it is still slot `id`.
    fn retire_slot(&mut self, key: &str, id: u64) -> Option<PendingSlot> {
        match self.pending.get(key) {
            Some(slot) if slot.id == id => self.pending.remove(key),
            _ => None,
        }
    }
}

/// A caller's claim on a pending slot. Dropping the last claim retires the slot.
struct SlotWaiter {
    inner: Arc<CacheInner>,
    key: String,
    id: u64,
}

impl Drop for SlotWaiter {
    fn drop(&mut self) {
        let orphaned = {
            let mut state = self.inner.state.lock();
            match state.pending.get_mut(&self.key) {
                Some(slot) if slot.id == self.id => {
                    slot.waiters -= 1;
                    if slot.waiters == 0 {
                        state.pending.remove(&self.key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if orphaned.is_some() {
            tracing::debug!(key = %self.key, "every waiter left, dropping producer");
        }
        // The producer is dropped here, outside the lock.
        drop(orphaned);
    }
}

struct CacheInner {
    state: Mutex<CacheState>,
}

/// TTL memo with single-flight coordination. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct EphemeralCache {
    inner: Arc<CacheInner>,
}

impl Default for EphemeralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EphemeralCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EphemeralCache")
            .field("entries", &state.entries.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Cap a requested TTL at [`MAX_TTL`].
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_TTL)
}

/// Content types whose bodies are safe to persist: json, xml, yaml and text families.
/// Anything mentioning "stream" is excluded.
pub fn is_cacheable_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("stream") {
        return false;
    }
    ct.contains("json") || ct.contains("xml") || ct.contains("yaml") || ct.starts_with("text/")
}

fn should_persist(response: &CachedResponse) -> bool {
    response.is_success()
        && !response.body.is_empty()
        && response
            .content_type()
            .map(is_cacheable_content_type)
            .unwrap_or(false)
}

impl EphemeralCache {
    pub fn new() -> Self {
        EphemeralCache {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Fresh entry for `key`, judged against `ttl_override` when given.
    pub fn get(&self, key: &str, ttl_override: Option<Duration>) -> Option<CachedResponse> {
        let key = key.trim();
        let mut state = self.inner.state.lock();
        state
            .fresh_entry(key, Instant::now(), ttl_override)
            .map(|entry| entry.response.clone())
    }

    /// Store `response` for `ttl` (capped at [`MAX_TTL`]). Empty bodies are ignored.
    pub fn set(&self, key: &str, response: CachedResponse, ttl: Duration) -> Result<(), CacheError> {
        self.set_with_tags(key, response, ttl, Vec::new())
    }

    fn set_with_tags(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
        tags: Vec<String>,
    ) -> Result<(), CacheError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(CacheError::InvalidKey);
        }
        let ttl = clamp_ttl(ttl);
        if response.body.is_empty() || ttl.is_zero() {
            return Ok(());
        }
        self.inner.state.lock().entries.insert(
            key.to_string(),
            CacheEntry {
                response,
                stored_at: Instant::now(),
                ttl,
                tags,
            },
        );
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        let key = key.trim();
        let mut state = self.inner.state.lock();
        state.fresh_entry(key, Instant::now(), None).is_some()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.state.lock().entries.remove(key.trim()).is_some()
    }

    /// Drop every entry. In-flight producers are left alone.
    pub fn clear(&self) {
        self.inner.state.lock().entries.clear();
    }

    /// Evict stale entries; returns how many were removed.
    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh(now, None));
        before - state.entries.len()
    }

    /// Restart the TTL of a fresh entry. Returns false if there is none.
    pub fn refresh_ttl(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        match state.fresh_entry(key.trim(), now, None) {
            Some(entry) => {
                entry.stored_at = now;
                true
            }
            None => false,
        }
    }

    /// Number of stored entries, fresh or not yet evicted.
    pub fn size(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Number of producers currently in flight.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Drop every entry stored with `tag`; returns how many were removed.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
        before - state.entries.len()
    }

    /// Periodically evict stale entries until the cache is dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let cache = EphemeralCache { inner };
                let evicted = cache.clear_expired();
                if evicted > 0 {
                    tracing::trace!(evicted, "swept expired cache entries");
                }
            }
        })
    }

    /// Serve `key` from cache, join an in-flight producer for it, or run `producer`.
    ///
    /// An empty key or a zero TTL bypasses the cache entirely: `producer` runs and
    /// nothing is shared or stored.
    pub async fn wrap<F, Fut>(
        &self,
        key: &str,
        producer: F,
        opts: WrapOptions,
    ) -> Result<CachedResponse, RpcError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Produced, RpcError>> + Send + 'static,
    {
        let key = key.trim();
        let ttl = clamp_ttl(opts.ttl);
        if key.is_empty() || ttl.is_zero() {
            return producer().await.map(|produced| produced.response);
        }

        let (pending, waiter, owner) = {
            let now = Instant::now();
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.fresh_entry(key, now, None) {
                if opts.refresh_ttl {
                    entry.stored_at = now;
                }
                tracing::trace!(key, "cache hit");
                return Ok(entry.response.clone());
            }
            let state = &mut *state;
            let owner = !state.pending.contains_key(key);
            if !owner {
                tracing::trace!(key, "joining in-flight producer");
            }
            let slot = state.pending.entry(key.to_string()).or_insert_with(|| {
                let id = state.next_slot;
                state.next_slot += 1;
                let future = produce(
                    Arc::downgrade(&self.inner),
                    key.to_string(),
                    id,
                    ttl,
                    producer().boxed(),
                )
                .boxed()
                .shared();
                PendingSlot {
                    id,
                    future,
                    waiters: 0,
                }
            });
            slot.waiters += 1;
            let waiter = SlotWaiter {
                inner: self.inner.clone(),
                key: key.to_string(),
                id: slot.id,
            };
            (slot.future.clone(), waiter, owner)
        };

        let result = pending.await;
        drop(waiter);
        if owner {
            // Let waiters queued behind the slot observe the result before we return.
            tokio::task::yield_now().await;
        }
        result
    }
}

/// Run a producer, then atomically retire its pending slot and persist the result.
async fn produce(
    inner: Weak<CacheInner>,
    key: String,
    slot: u64,
    ttl: Duration,
    producer: BoxFuture<'static, Result<Produced, RpcError>>,
) -> Result<CachedResponse, RpcError> {
    let outcome = producer.await;

    let Some(inner) = inner.upgrade() else {
        return outcome.map(|produced| produced.response);
    };
    let mut state = inner.state.lock();
    // The waiter polling this future holds its own clone, so the slot's copy can go.
    state.retire_slot(&key, slot);

    let Produced { response, policy } = outcome?;
    if let Some(policy) = policy {
        let ttl = policy.ttl.map(clamp_ttl).unwrap_or(ttl);
        if should_persist(&response) && !ttl.is_zero() {
            tracing::trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "persisting response");
            state.entries.insert(
                key,
                CacheEntry {
                    response: response.clone(),
                    stored_at: Instant::now(),
                    ttl,
                    tags: policy.tags,
                },
            );
        }
    }
    Ok(response)
}

impl CacheInterface for EphemeralCache {
    fn wrap(
        &self,
        key: String,
        producer: BoxFuture<'static, Result<Produced, RpcError>>,
        opts: WrapOptions,
    ) -> BoxFuture<'_, Result<CachedResponse, RpcError>> {
        async move { EphemeralCache::wrap(self, &key, move || producer, opts).await }.boxed()
    }

    fn set(&self, key: &str, response: CachedResponse, policy: CachePolicy) -> Result<(), RpcError> {
        let ttl = policy.ttl.unwrap_or(MAX_TTL);
        self.set_with_tags(key, response, ttl, policy.tags)
            .map_err(RpcError::from)
    }
}
