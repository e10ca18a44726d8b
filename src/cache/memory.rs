use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};

/// Cache entry with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Vec<u8>,
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub size: usize,
}

impl CacheEntry {
    pub fn new(data: Vec<u8>, compressed: bool, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            size: data.len(),
            data,
            compressed,
            created_at: now,
            ttl,
            access_count: 0,
            last_accessed: now,
        }
    }

    /// An entry is expired once strictly more than `ttl` has elapsed since creation.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.created_at) > ttl,
            // Out-of-range TTLs never expire
            Err(_) => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

/// Read-only view of an entry's bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub created_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub size: usize,
    pub compressed: bool,
}

impl From<&CacheEntry> for EntryInfo {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            created_at: entry.created_at,
            ttl: entry.ttl,
            access_count: entry.access_count,
            last_accessed: entry.last_accessed,
            size: entry.size,
            compressed: entry.compressed,
        }
    }
}

/// Namespace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub max_size: usize,
    pub default_ttl: Option<Duration>,
    /// Values whose encoded size reaches this many bytes are gzip-compressed
    pub compression_threshold: Option<usize>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Some(Duration::from_secs(3600)), // 1 hour
            compression_threshold: Some(4 * 1024),       // 4KB
        }
    }
}

/// Namespace statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entry_count: usize,
    pub max_size: usize,
    pub memory_usage: usize,
}

impl NamespaceStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of a namespace lookup
#[derive(Debug)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
    Expired,
}

/// One access-ordered, size-bounded namespace.
///
/// Not synchronized itself; `MultiLevelCache` keeps each namespace behind its own lock.
pub struct CacheNamespace {
    name: String,
    config: NamespaceConfig,
    entries: LruCache<String, CacheEntry>,
    stats: NamespaceStats,
    memory_usage: usize,
}

impl CacheNamespace {
    pub fn new(name: impl Into<String>, config: NamespaceConfig) -> Self {
        let max_size = config.max_size.max(1);
        Self {
            name: name.into(),
            config: NamespaceConfig { max_size, ..config },
            // Size is enforced here so evictions can be counted
            entries: LruCache::unbounded(),
            stats: NamespaceStats {
                max_size,
                ..Default::default()
            },
            memory_usage: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a key, promoting it on hit and dropping it if expired.
    pub fn get(&mut self, key: &str) -> Lookup {
        let expired = match self.entries.get_mut(key) {
            None => {
                self.stats.misses += 1;
                return Lookup::Miss;
            }
            Some(entry) if entry.is_expired() => true,
            Some(entry) => {
                entry.touch();
                self.stats.hits += 1;
                return Lookup::Hit(entry.clone());
            }
        };

        debug_assert!(expired);
        self.remove_entry(key);
        self.stats.misses += 1;
        self.stats.expirations += 1;
        Lookup::Expired
    }

    /// Insert or replace a key and evict least-recently-used entries beyond `max_size`.
    ///
    /// Returns the evicted keys, oldest first.
    pub fn set(&mut self, key: &str, data: Vec<u8>, compressed: bool, ttl: Option<Duration>) -> Vec<String> {
        let entry = CacheEntry::new(data, compressed, ttl.or(self.config.default_ttl));
        self.memory_usage += entry.size;

        if let Some(previous) = self.entries.put(key.to_string(), entry) {
            self.memory_usage = self.memory_usage.saturating_sub(previous.size);
        }

        let mut evicted = Vec::new();
        while self.entries.len() > self.config.max_size {
            match self.entries.pop_lru() {
                Some((evicted_key, entry)) => {
                    self.memory_usage = self.memory_usage.saturating_sub(entry.size);
                    self.stats.evictions += 1;
                    evicted.push(evicted_key);
                }
                None => break,
            }
        }
        evicted
    }

    /// Drop an entry that turned out to be unreadable. Counted as a miss.
    pub fn discard_corrupted(&mut self, key: &str) {
        if self.remove_entry(key).is_some() {
            self.stats.hits = self.stats.hits.saturating_sub(1);
            self.stats.misses += 1;
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.remove_entry(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.peek(key).is_some_and(|entry| !entry.is_expired())
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        self.entries.peek(key).map(EntryInfo::from)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.memory_usage = 0;
    }

    /// Remove every expired entry. Returns (entries removed, bytes freed).
    pub fn purge_expired(&mut self) -> (usize, usize) {
        let now = Utc::now();
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut freed = 0;
        for key in &expired_keys {
            if let Some(entry) = self.remove_entry(key) {
                freed += entry.size;
                self.stats.expirations += 1;
            }
        }
        (expired_keys.len(), freed)
    }

    /// Evict the least-recently-used `fraction` of entries (rounded up). Returns bytes freed.
    pub fn trim(&mut self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let target = (self.entries.len() as f64 * fraction).ceil() as usize;

        let mut freed = 0;
        for _ in 0..target {
            match self.entries.pop_lru() {
                Some((_, entry)) => {
                    freed += entry.size;
                    self.memory_usage = self.memory_usage.saturating_sub(entry.size);
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
        freed
    }

    pub fn stats(&self) -> NamespaceStats {
        NamespaceStats {
            entry_count: self.entries.len(),
            memory_usage: self.memory_usage,
            ..self.stats.clone()
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = NamespaceStats {
            max_size: self.config.max_size,
            ..Default::default()
        };
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.pop(key);
        if let Some(entry) = &removed {
            self.memory_usage = self.memory_usage.saturating_sub(entry.size);
        }
        removed
    }
}
