//! In-process L1 tier: TTL map with LRU eviction at a fixed entry cap.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::glob::glob_match;

struct Entry {
    value: Value,
    expires_at: Instant,
    last_access: Instant,
}

pub(crate) struct MemoryCache {
    max_entries: usize,
    map: HashMap<String, Entry>,
}

impl MemoryCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            map: HashMap::new(),
        }
    }

    /// Expired entries are removed on access, never served.
    pub(crate) fn get(&mut self, key: &str) -> Option<Value> {
        let now = Instant::now();
        match self.map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                self.map.remove(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn set(&mut self, key: String, value: Value, ttl: Duration) {
        let now = Instant::now();
        self.map.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                last_access: now,
            },
        );
        if self.map.len() > self.max_entries {
            self.evict_lru();
        }
    }

    fn evict_lru(&mut self) {
        if let Some(victim) = self
            .map
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone())
        {
            self.map.remove(&victim);
        }
    }

    pub(crate) fn invalidate(&mut self, pattern: &str) -> usize {
        let victims: Vec<String> = self
            .map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        for k in &victims {
            self.map.remove(k);
        }
        victims.len()
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
