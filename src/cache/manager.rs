use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::memory::{CacheNamespace, EntryInfo, Lookup, NamespaceConfig, NamespaceStats};
use crate::infrastructure::error::CacheError;
use crate::memory::{MemoryPressure, ReclamationHook};

/// Multi-namespace cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Used for namespaces that were never registered explicitly
    pub default_namespace: NamespaceConfig,
    /// Namespaces created up front with their own limits
    pub namespaces: HashMap<String, NamespaceConfig>,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_namespace: NamespaceConfig::default(),
            namespaces: HashMap::new(),
            cleanup_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entry_count: usize,
    pub memory_usage: usize,
    pub namespaces: BTreeMap<String, NamespaceStats>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn add(&mut self, name: &str, stats: NamespaceStats) {
        self.hits += stats.hits;
        self.misses += stats.misses;
        self.evictions += stats.evictions;
        self.expirations += stats.expirations;
        self.entry_count += stats.entry_count;
        self.memory_usage += stats.memory_usage;
        self.namespaces.insert(name.to_string(), stats);
    }
}

type SharedNamespace = Arc<Mutex<CacheNamespace>>;

/// Namespaced TTL + LRU cache shared by all workers.
///
/// Values are stored bincode-encoded so one cache can hold different types per namespace.
/// Concurrent misses on the same key are not coalesced: callers doing cache-aside may
/// compute the same value more than once.
pub struct MultiLevelCache {
    namespaces: Arc<RwLock<HashMap<String, SharedNamespace>>>,
    config: CacheConfig,
}

impl MultiLevelCache {
    pub fn new(config: CacheConfig) -> Self {
        let namespaces = config
            .namespaces
            .iter()
            .map(|(name, ns_config)| {
                let namespace = CacheNamespace::new(name.clone(), ns_config.clone());
                (name.clone(), Arc::new(Mutex::new(namespace)))
            })
            .collect();

        Self {
            namespaces: Arc::new(RwLock::new(namespaces)),
            config,
        }
    }

    /// Create or reconfigure a namespace. Reconfiguring drops its current entries.
    pub async fn register_namespace(&self, name: &str, config: NamespaceConfig) {
        let mut namespaces = self.namespaces.write().await;
        namespaces.insert(
            name.to_string(),
            Arc::new(Mutex::new(CacheNamespace::new(name, config))),
        );
    }

    /// Get data from cache. `Some` is a hit.
    pub async fn get<T>(&self, namespace: &str, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let shared = self.namespace(namespace).await;
        let mut ns = shared.lock().await;

        let entry = match ns.get(key) {
            Lookup::Hit(entry) => entry,
            Lookup::Expired => {
                debug!(namespace, key, "cache entry expired");
                return None;
            }
            Lookup::Miss => return None,
        };

        match decode::<T>(&entry.data, entry.compressed) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(namespace, key, error = %e, "dropping unreadable cache entry");
                ns.discard_corrupted(key);
                None
            }
        }
    }

    /// Set data in cache. `ttl` falls back to the namespace default.
    pub async fn set<T>(&self, namespace: &str, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let shared = self.namespace(namespace).await;
        let threshold = shared.lock().await.config().compression_threshold;

        // Encode outside the lock
        let (data, compressed) = encode(value, threshold).map_err(|message| match message {
            EncodeError::Serialize(message) => CacheError::Serialization {
                namespace: namespace.to_string(),
                message,
            },
            EncodeError::Compress(message) => CacheError::Compression {
                namespace: namespace.to_string(),
                message,
            },
        })?;

        let evicted = shared.lock().await.set(key, data, compressed, ttl);
        if !evicted.is_empty() {
            debug!(namespace, evicted = evicted.len(), "evicted least recently used entries");
        }
        Ok(())
    }

    pub async fn remove(&self, namespace: &str, key: &str) -> bool {
        match self.existing(namespace).await {
            Some(shared) => shared.lock().await.remove(key),
            None => false,
        }
    }

    /// Check presence without touching LRU order or statistics
    pub async fn contains_key(&self, namespace: &str, key: &str) -> bool {
        match self.existing(namespace).await {
            Some(shared) => shared.lock().await.contains_key(key),
            None => false,
        }
    }

    pub async fn entry_info(&self, namespace: &str, key: &str) -> Option<EntryInfo> {
        let shared = self.existing(namespace).await?;
        let ns = shared.lock().await;
        ns.entry_info(key)
    }

    pub async fn keys(&self, namespace: &str) -> Vec<String> {
        match self.existing(namespace).await {
            Some(shared) => shared.lock().await.keys(),
            None => Vec::new(),
        }
    }

    /// Clear one namespace, or every namespace when `None`
    pub async fn clear(&self, namespace: Option<&str>) {
        for shared in self.select(namespace).await {
            let mut ns = shared.lock().await;
            ns.clear();
            ns.reset_stats();
        }
    }

    /// Statistics for one namespace, or aggregated over all of them when `None`
    pub async fn stats(&self, namespace: Option<&str>) -> CacheStats {
        let mut stats = CacheStats::default();
        for shared in self.select(namespace).await {
            let ns = shared.lock().await;
            stats.add(ns.name(), ns.stats());
        }
        stats
    }

    /// Remove expired entries everywhere. Returns (entries removed, bytes freed).
    pub async fn purge_expired(&self) -> (usize, usize) {
        let mut removed = 0;
        let mut freed = 0;
        for shared in self.select(None).await {
            let (r, f) = shared.lock().await.purge_expired();
            removed += r;
            freed += f;
        }
        (removed, freed)
    }

    /// LRU-evict `fraction` of every namespace. Returns bytes freed.
    pub async fn trim(&self, fraction: f64) -> usize {
        let mut freed = 0;
        for shared in self.select(None).await {
            freed += shared.lock().await.trim(fraction);
        }
        freed
    }

    /// Periodically purge expired entries until `cancel` fires
    pub fn start_cleanup_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let cleanup_interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let (removed, freed) = cache.purge_expired().await;
                        if removed > 0 {
                            debug!(removed, freed, "purged expired cache entries");
                        }
                    }
                }
            }
        })
    }

    async fn namespace(&self, name: &str) -> SharedNamespace {
        if let Some(shared) = self.existing(name).await {
            return shared;
        }

        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CacheNamespace::new(
                    name,
                    self.config.default_namespace.clone(),
                )))
            })
            .clone()
    }

    async fn existing(&self, name: &str) -> Option<SharedNamespace> {
        self.namespaces.read().await.get(name).cloned()
    }

    async fn select(&self, namespace: Option<&str>) -> Vec<SharedNamespace> {
        let namespaces = self.namespaces.read().await;
        match namespace {
            Some(name) => namespaces.get(name).cloned().into_iter().collect(),
            None => namespaces.values().cloned().collect(),
        }
    }
}

#[async_trait]
impl ReclamationHook for MultiLevelCache {
    fn name(&self) -> &str {
        "multi_level_cache"
    }

    async fn reclaim(&self, pressure: MemoryPressure) -> usize {
        let (_, expired_bytes) = self.purge_expired().await;
        let fraction = match pressure {
            MemoryPressure::Low => 0.0,
            MemoryPressure::Medium => 0.1,
            MemoryPressure::High => 0.25,
            MemoryPressure::Critical => 0.5,
        };
        expired_bytes + self.trim(fraction).await
    }
}

enum EncodeError {
    Serialize(String),
    Compress(String),
}

fn encode<T>(value: &T, compression_threshold: Option<usize>) -> Result<(Vec<u8>, bool), EncodeError>
where
    T: Serialize + ?Sized,
{
    let serialized = bincode::serialize(value).map_err(|e| EncodeError::Serialize(e.to_string()))?;

    match compression_threshold {
        Some(threshold) if serialized.len() >= threshold => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&serialized)
                .map_err(|e| EncodeError::Compress(e.to_string()))?;
            let compressed = encoder.finish().map_err(|e| EncodeError::Compress(e.to_string()))?;
            Ok((compressed, true))
        }
        _ => Ok((serialized, false)),
    }
}

fn decode<T>(data: &[u8], compressed: bool) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    if compressed {
        let mut decoder = GzDecoder::new(data);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        Ok(bincode::deserialize(&raw)?)
    } else {
        Ok(bincode::deserialize(data)?)
    }
}
