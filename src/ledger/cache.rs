//! Count cache
//!
//! Short-lived cache of per-account warning counts built on Moka. Entries
//! share one TTL and are invalidated, never updated in place, whenever the
//! ledger changes.

use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use moka::sync::Cache;
use tracing::warn;

use super::record::AccountName;
use super::{LedgerError, LedgerResult};
use crate::LEDGER_TARGET;

/// Default lifetime of a cached count
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Largest accepted TTL (one day)
pub const MAX_TTL_SECS: u64 = 86_400;

/// Most counts kept at once; least recently used ones go first
pub const MAX_CACHED_COUNTS: u64 = 10_000;

const COUNT_PREFIX: &str = "warn_count:";

/// Pattern matching every cached warning count
pub const COUNT_PATTERN: &str = "warn_count:*";

/// Bounded TTL cache keyed by string
pub struct CountCache {
    entries: Cache<String, u64>,
}

impl Default for CountCache {
    fn default() -> Self {
        Self::build(Some(Duration::from_secs(DEFAULT_TTL_SECS)))
    }
}

impl CountCache {
    /// Cache with the default five minute TTL
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache with a TTL in seconds; zero keeps entries until invalidated
    ///
    /// # Errors
    /// Returns a validation error above one day.
    pub fn with_ttl(ttl_secs: u64) -> LedgerResult<Self> {
        Ok(Self::build(Self::validate_ttl(ttl_secs)?))
    }

    fn build(ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(MAX_CACHED_COUNTS);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            entries: builder.build(),
        }
    }

    /// Cache key for an account's warning count
    #[must_use]
    pub fn count_key(account: &AccountName) -> String {
        format!("{COUNT_PREFIX}{account}")
    }

    /// Validate a TTL in seconds; zero means entries never expire
    ///
    /// # Errors
    /// Returns a validation error above one day.
    pub fn validate_ttl(ttl_secs: u64) -> LedgerResult<Option<Duration>> {
        if ttl_secs > MAX_TTL_SECS {
            return Err(LedgerError::validation(format!(
                "cache TTL must be between 0 and {MAX_TTL_SECS} seconds, got {ttl_secs}"
            )));
        }
        Ok((ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)))
    }

    pub fn set(&self, key: impl Into<String>, value: u64) {
        self.entries.insert(key.into(), value);
    }

    /// Fetch a value that has not outlived the TTL
    #[must_use]
    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.get(key)
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.invalidate(key);
    }

    /// Drop every key matching a glob pattern such as `warn_count:*`
    pub fn invalidate_matching(&self, pattern: &str) -> usize {
        let pattern = match Pattern::new(pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(target: LEDGER_TARGET, "Invalid cache pattern '{pattern}': {e}");
                return 0;
            }
        };
        let keys: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.entries.invalidate(key.as_str());
        }
        keys.len()
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_bounds() {
        assert_eq!(CountCache::validate_ttl(0).unwrap(), None);
        assert_eq!(
            CountCache::validate_ttl(MAX_TTL_SECS).unwrap(),
            Some(Duration::from_secs(MAX_TTL_SECS))
        );
        assert!(CountCache::validate_ttl(MAX_TTL_SECS + 1).is_err());
        assert!(CountCache::with_ttl(MAX_TTL_SECS + 1).is_err());
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = CountCache::with_ttl(1).unwrap();
        cache.set("warn_count:steve", 2);
        assert_eq!(cache.get("warn_count:steve"), Some(2));

        std::thread::sleep(Duration::from_millis(1_200));
        assert_eq!(cache.get("warn_count:steve"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_value_stored_after_expiry_is_served() {
        let cache = CountCache::with_ttl(1).unwrap();
        cache.set("warn_count:steve", 1);
        std::thread::sleep(Duration::from_millis(1_200));

        cache.set("warn_count:steve", 2);
        assert_eq!(cache.get("warn_count:steve"), Some(2));
    }

    #[test]
    fn test_zero_ttl_keeps_entries() {
        let cache = CountCache::with_ttl(0).unwrap();
        cache.set("warn_count:steve", 4);
        assert_eq!(cache.get("warn_count:steve"), Some(4));
        cache.invalidate("warn_count:steve");
        assert_eq!(cache.get("warn_count:steve"), None);
    }

    #[test]
    fn test_pattern_invalidation() {
        let cache = CountCache::with_ttl(0).unwrap();
        cache.set(CountCache::count_key(&"Steve".into()), 1);
        cache.set(CountCache::count_key(&"alex".into()), 1);
        cache.set("other:thing", 1);

        assert_eq!(cache.invalidate_matching(COUNT_PATTERN), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("other:thing"), Some(1));
        assert_eq!(cache.invalidate_matching("[unclosed"), 0);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_count_key_is_normalized() {
        assert_eq!(CountCache::count_key(&AccountName::new("STEVE")), "warn_count:steve");
    }
}
