//! Freshness options for cache reads.
//!
//! Callers state their staleness tolerance on every read: a TTL after which
//! the entry is stale, and whether a stale entry may be served while a
//! refresh runs in the background.

use std::time::Duration;

/// Per-read cache options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Age after which a stored entry is stale.
    pub ttl: Duration,
    /// Serve stale entries immediately and refresh in the background.
    pub stale_while_revalidate: bool,
}

impl CacheOptions {
    /// Options that block on a refetch once the entry is stale.
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_while_revalidate: false,
        }
    }

    /// Options that serve stale entries while refreshing.
    pub fn swr(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_while_revalidate: true,
        }
    }

    pub fn with_stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }
}

impl From<&lodge_core::CacheConfig> for CacheOptions {
    fn from(config: &lodge_core::CacheConfig) -> Self {
        Self {
            ttl: config.default_ttl(),
            stale_while_revalidate: config.stale_while_revalidate,
        }
    }
}

/// Snapshot of a cached value carrying staleness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    age: Duration,
    ttl: Duration,
}

impl<T> CacheRead<T> {
    pub(crate) fn new(value: T, age: Duration, ttl: Duration) -> Self {
        Self { value, age, ttl }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Time since the value was stored.
    pub fn age(&self) -> Duration {
        self.age
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_fresh(&self) -> bool {
        self.age < self.ttl
    }

    pub fn is_stale(&self) -> bool {
        !self.is_fresh()
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            age: self.age,
            ttl: self.ttl,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
