pub mod manager;
pub mod memory;
pub mod strategy;

pub use manager::{CacheConfig, CacheStats, MultiLevelCache};
pub use memory::{CacheEntry, CacheNamespace, EntryInfo, NamespaceConfig, NamespaceStats};
pub use strategy::{content_hash, namespaces};
