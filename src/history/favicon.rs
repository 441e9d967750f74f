//! Domain favicon cache with expiry

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::history::aggregator::extract_domain;
use crate::history::kv::{load_json, store_json, KeyValueStore, StorageError, FAVICON_CACHE_KEY};
use crate::history::models::{Timestamp, VisitRecord};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaviconEntry {
    pub url: String,
    pub timestamp: Timestamp,
}

/// Domain → favicon URL; entries older than the TTL are dropped
#[derive(Debug, Clone, PartialEq)]
pub struct FaviconCache {
    entries: BTreeMap<String, FaviconEntry>,
    ttl_ms: i64,
    dirty: bool,
}

impl FaviconCache {
    pub fn new(ttl_days: i64) -> Self {
        Self {
            entries: BTreeMap::new(),
            ttl_ms: ttl_days.max(0).saturating_mul(DAY_MS),
            dirty: false,
        }
    }

    fn is_fresh(&self, entry: &FaviconEntry, now: Timestamp) -> bool {
        now - entry.timestamp < self.ttl_ms
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, domain: &str, now: Timestamp) -> Option<&str> {
        self.entries
            .get(domain)
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.url.as_str())
    }

    /// Remember a favicon; returns whether the cache changed
    pub fn record(&mut self, domain: &str, url: &str, now: Timestamp) -> bool {
        if url.is_empty() {
            return false;
        }
        if let Some(existing) = self.entries.get(domain) {
            if existing.url == url && self.is_fresh(existing, now) {
                return false;
            }
        }
        self.entries.insert(
            domain.to_string(),
            FaviconEntry {
                url: url.to_string(),
                timestamp: now,
            },
        );
        self.dirty = true;
        true
    }

    /// Pick up the favicon carried by a visit record, if any
    pub fn observe_visit(&mut self, record: &VisitRecord, now: Timestamp) -> bool {
        match (&record.favicon_url, extract_domain(&record.url)) {
            (Some(favicon), Some(domain)) => self.record(&domain, favicon, now),
            _ => false,
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn prune(&mut self, now: Timestamp) -> usize {
        let before = self.entries.len();
        let ttl_ms = self.ttl_ms;
        self.entries.retain(|_, entry| now - entry.timestamp < ttl_ms);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Fresh entries as `domain → url`
    pub fn snapshot(&self, now: Timestamp) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|(_, entry)| self.is_fresh(entry, now))
            .map(|(domain, entry)| (domain.clone(), entry.url.clone()))
            .collect()
    }

    /// Load from the store, pruning expired entries
    pub fn load(store: &dyn KeyValueStore, ttl_days: i64, now: Timestamp) -> Self {
        let mut cache = Self::new(ttl_days);
        match load_json::<BTreeMap<String, FaviconEntry>, _>(store, FAVICON_CACHE_KEY) {
            Ok(Some(entries)) => {
                cache.entries = entries;
                let pruned = cache.prune(now);
                if pruned > 0 {
                    log::debug!("Pruned {} expired favicons", pruned);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load favicon cache: {}", e),
        }
        cache
    }

    pub fn persist(&mut self, store: &dyn KeyValueStore) -> Result<bool, StorageError> {
        if !self.dirty {
            return Ok(false);
        }
        store_json(store, FAVICON_CACHE_KEY, &self.entries)?;
        self.dirty = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::kv::MemoryKvStore;

    const NOW: Timestamp = 1_718_000_000_000;

    #[test]
    fn test_entries_expire_after_ttl() {
        let mut cache = FaviconCache::new(7);
        assert!(cache.record("a.com", "https://a.com/favicon.ico", NOW));
        assert!(!cache.record("a.com", "https://a.com/favicon.ico", NOW + 1));

        assert!(cache.get("a.com", NOW + 6 * DAY_MS).is_some());
        assert!(cache.get("a.com", NOW + 7 * DAY_MS).is_none());
        assert_eq!(cache.prune(NOW + 8 * DAY_MS), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_load_prunes_expired() {
        let store = MemoryKvStore::new();
        let mut cache = FaviconCache::new(7);
        cache.record("old.com", "https://old.com/f.ico", NOW - 10 * DAY_MS);
        cache.record("new.com", "https://new.com/f.ico", NOW - DAY_MS);
        assert!(cache.persist(&store).unwrap());

        let loaded = FaviconCache::load(&store, 7, NOW);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.snapshot(NOW).get("new.com").unwrap(), "https://new.com/f.ico");
    }

    #[test]
    fn test_observe_visit_uses_record_favicon() {
        let mut cache = FaviconCache::new(7);
        let mut record = VisitRecord::new("https://www.a.com/x", "", NOW);
        assert!(!cache.observe_visit(&record, NOW));

        record.favicon_url = Some("https://a.com/icon.png".to_string());
        assert!(cache.observe_visit(&record, NOW));
        assert_eq!(cache.get("a.com", NOW), Some("https://a.com/icon.png"));
    }
}
