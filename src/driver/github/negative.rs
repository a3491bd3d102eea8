//! Negative cache of repositories the API reported as missing.
//!
//! Keeps repeated resolves of a mistyped or deleted repository from hitting
//! the API every time. Entries expire so that repositories created (or made
//! visible) later are eventually found.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::names::RepoKey;

/// Default TTL for negative cache entries (1 hour).
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Repositories known not to exist, keyed by case-folded `owner/repo`.
pub struct NegativeCache {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl Default for NegativeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NegativeCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Check if a repo is in the cache and not expired.
    pub fn contains(&self, key: &RepoKey) -> bool {
        let folded = key.folded();
        if let Some(cached_at) = self.entries.get(&folded) {
            if cached_at.elapsed() < self.ttl {
                return true;
            }
            // Expired
            drop(cached_at);
            self.entries.remove(&folded);
        }
        false
    }

    pub fn insert(&self, key: &RepoKey) {
        log::debug!("Remembering {} as missing", key);
        self.entries.insert(key.folded(), Instant::now());
    }

    /// Forget a repository, e.g. after it showed up in a catalogue refresh.
    pub fn remove(&self, key: &RepoKey) {
        self.entries.remove(&key.folded());
    }
}
