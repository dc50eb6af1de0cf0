use std::time::Duration;

use skein_core::MAX_TTL;

/// Default upper bound on the number of items in one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 256;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Path segments starting with any of these are never dispatchable.
    pub private_prefixes: Vec<char>,
    /// Top-level names that belong to the dispatcher itself.
    pub reserved: Vec<String>,
    /// TTL handed to the cache for every call; a response's own directive may shorten it.
    pub cache_ttl: Duration,
    /// Keep `detail` on normalized errors. Off by default.
    pub expose_error_detail: bool,
    pub max_batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            private_prefixes: vec!['_', '#', '$'],
            reserved: vec!["call".into(), "callMany".into(), "fetch".into()],
            cache_ttl: MAX_TTL,
            expose_error_detail: false,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl DispatcherConfig {
    pub fn with_private_prefixes(mut self, prefixes: impl IntoIterator<Item = char>) -> Self {
        self.private_prefixes = prefixes.into_iter().collect();
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_error_detail(mut self, expose: bool) -> Self {
        self.expose_error_detail = expose;
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    pub fn is_private(&self, segment: &str) -> bool {
        segment
            .chars()
            .next()
            .is_some_and(|c| self.private_prefixes.contains(&c))
    }

    pub fn is_reserved(&self, resource: &str) -> bool {
        let head = resource.split('.').next().unwrap_or(resource);
        self.reserved.iter().any(|r| r == head)
    }
}
