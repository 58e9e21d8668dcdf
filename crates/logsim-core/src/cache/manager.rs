use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::CacheInvalidator;

/// Default lifetime of a cached response, in seconds.
/// Matches the console's query-cache default of one minute.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl<T> CachedData<T> {
    pub fn new(data: T, tags: Vec<String>) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
            tags,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        Utc::now() - self.cached_at > ttl
    }

    fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }
}

/// In-memory cache of successful GET responses, keyed by request.
///
/// Never persisted: cached data is authorization-scoped and is dropped
/// whenever credentials change.
pub struct CacheManager {
    entries: RwLock<HashMap<String, CachedData<Value>>>,
    /// Bumped by every `clear`, always under the `entries` write lock.
    generation: AtomicU64,
    ttl: Duration,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(DEFAULT_CACHE_TTL_SECS))
    }
}

impl CacheManager {
    pub fn new(ttl: std::time::Duration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| {
            Duration::seconds(DEFAULT_CACHE_TTL_SECS as i64)
        });
        Self {
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    /// Current clear generation. Capture it before fetching something that
    /// will be passed to `store_if_current`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Fresh entry for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(cached) if !cached.is_stale(self.ttl) => Some(cached.data.clone()),
            _ => None,
        }
    }

    pub fn store(&self, key: String, data: Value, tags: Vec<String>) {
        debug!(cache = %key, "Caching response");
        self.entries.write().insert(key, CachedData::new(data, tags));
    }

    /// Store `data` only if the cache was not cleared since `generation`
    /// was captured. Returns whether it was stored.
    pub fn store_if_current(&self, key: String, data: Value, tags: Vec<String>, generation: u64) -> bool {
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            debug!(cache = %key, "Cache cleared since fetch, not caching");
            return false;
        }
        debug!(cache = %key, "Caching response");
        entries.insert(key, CachedData::new(data, tags));
        true
    }

    /// Drop entries carrying any of `tags`. Returns how many were dropped.
    pub fn invalidate_tags(&self, tags: &[String]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, cached| !cached.has_any_tag(tags));
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(?tags, dropped, "Invalidated cached responses");
        }
        dropped
    }

    /// Drop everything. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let dropped = entries.len();
        entries.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Cache keys with a human-readable age, oldest first.
    pub fn ages(&self) -> Vec<(String, String)> {
        let entries = self.entries.read();
        let mut ages: Vec<_> = entries
            .iter()
            .map(|(key, cached)| (cached.cached_at, key.clone(), cached.age_display()))
            .collect();
        ages.sort();
        ages.into_iter().map(|(_, key, age)| (key, age)).collect()
    }
}

impl CacheInvalidator for CacheManager {
    fn credentials_rotated(&self) {
        let dropped = self.clear();
        debug!(dropped, "Dropped responses cached under previous credentials");
    }

    fn purge_all(&self) {
        let dropped = self.clear();
        debug!(dropped, "Purged response cache");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cached_data_age_display_just_now() {
        let cached = CachedData::new(vec![1, 2, 3], vec![]);
        assert_eq!(cached.age_display(), "just now");
    }

    #[test]
    fn test_cached_data_age_display_rounding() {
        let mut cached = CachedData::new((), vec![]);
        cached.cached_at = Utc::now() - Duration::minutes(95);
        assert_eq!(cached.age_display(), "2h ago");
        cached.cached_at = Utc::now() - Duration::minutes(12);
        assert_eq!(cached.age_display(), "12m ago");
        cached.cached_at = Utc::now() - Duration::hours(30);
        assert_eq!(cached.age_display(), "1d ago");
    }

    #[test]
    fn test_cached_data_is_stale() {
        let fresh = CachedData::new(vec![1], vec![]);
        assert!(!fresh.is_stale(Duration::seconds(60)));

        let mut old = CachedData::new(vec![1], vec![]);
        old.cached_at = Utc::now() - Duration::seconds(61);
        assert!(old.is_stale(Duration::seconds(60)));
    }

    #[test]
    fn test_get_skips_stale_entries() {
        let cache = CacheManager::new(std::time::Duration::from_secs(60));
        cache.store("GET /jobs".into(), json!([1]), tags(&["Job"]));
        assert_eq!(cache.get("GET /jobs"), Some(json!([1])));

        cache
            .entries
            .write()
            .get_mut("GET /jobs")
            .expect("entry present")
            .cached_at = Utc::now() - Duration::seconds(120);
        assert_eq!(cache.get("GET /jobs"), None);
    }

    #[test]
    fn test_invalidate_tags_only_drops_matching() {
        let cache = CacheManager::default();
        cache.store("GET /jobs".into(), json!([]), tags(&["Job"]));
        cache.store("GET /jobs/1".into(), json!({}), tags(&["Job", "Job:1"]));
        cache.store("GET /templates".into(), json!([]), tags(&["Template"]));

        assert_eq!(cache.invalidate_tags(&tags(&["Job"])), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("GET /templates").is_some());
        assert_eq!(cache.invalidate_tags(&[]), 0);
    }

    #[test]
    fn test_invalidator_hooks_are_idempotent() {
        let cache = CacheManager::default();
        cache.store("GET /jobs".into(), json!([]), tags(&["Job"]));
        cache.credentials_rotated();
        assert!(cache.is_empty());
        cache.purge_all();
        cache.purge_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ages_lists_every_entry() {
        let cache = CacheManager::default();
        cache.store("GET /a".into(), json!(1), vec![]);
        cache.store("GET /b".into(), json!(2), vec![]);
        let ages = cache.ages();
        assert_eq!(ages.len(), 2);
        assert!(ages.iter().all(|(_, age)| age == "just now"));
    }

    #[test]
    fn test_store_if_current_refuses_after_clear() {
        let cache = CacheManager::default();
        let before = cache.generation();
        cache.store_if_current("GET /jobs".into(), json!([1]), tags(&["Job"]), before);
        assert_eq!(cache.len(), 1);

        let fetched_at = cache.generation();
        cache.purge_all();
        assert!(!cache.store_if_current("GET /jobs".into(), json!([2]), tags(&["Job"]), fetched_at));
        assert!(cache.is_empty());

        assert!(cache.store_if_current("GET /jobs".into(), json!([3]), tags(&["Job"]), cache.generation()));
        assert_eq!(cache.get("GET /jobs"), Some(json!([3])));
    }
}
