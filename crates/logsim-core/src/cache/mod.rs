//! Response caching and cache invalidation.
//!
//! `CacheManager` keeps successful GET responses in memory, tagged so that
//! mutations can drop what they affect. Anything holding data derived from
//! API responses can implement `CacheInvalidator` to be told when that data
//! must go:
//! - after a credential refresh (data may be scoped to the old credential)
//! - after the session is lost (everything must go)

pub mod manager;

use std::sync::Arc;

pub use manager::{CacheManager, CachedData, DEFAULT_CACHE_TTL_SECS};

/// Sink notified when cached response data becomes untrustworthy.
///
/// Calls may arrive more than once for the same event; implementations
/// must be idempotent. Calls are synchronous and complete before any request
/// waiting on the triggering refresh is released.
pub trait CacheInvalidator: Send + Sync {
    /// Credentials were rotated; drop data cached under the previous ones.
    fn credentials_rotated(&self);

    /// The session is gone; drop all cached data unconditionally.
    fn purge_all(&self);
}

/// Fans every notification out to a list of invalidators, in order.
#[derive(Clone, Default)]
pub struct Invalidators {
    sinks: Vec<Arc<dyn CacheInvalidator>>,
}

impl Invalidators {
    pub fn new(sinks: Vec<Arc<dyn CacheInvalidator>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn CacheInvalidator>) {
        self.sinks.push(sink);
    }
}

impl CacheInvalidator for Invalidators {
    fn credentials_rotated(&self) {
        for sink in &self.sinks {
            sink.credentials_rotated();
        }
    }

    fn purge_all(&self) {
        for sink in &self.sinks {
            sink.purge_all();
        }
    }
}
