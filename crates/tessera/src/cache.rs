//! Byte caches for fetched data.
//!
//! A byte cache sits in front of the network inside [`HttpFetcher`]. Hits
//! are reported back to the scheduler so statistics can tell disk/memory
//! loads apart from real downloads.
//!
//! # Implementations
//!
//! - [`MemoryCache`]: In-memory cache with an optional size limit
//! - [`NoCache`]: Passthrough implementation that caches nothing
//!
//! [`HttpFetcher`]: crate::fetch::HttpFetcher

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

/// A cache for fetched bytes, keyed by resource name.
pub trait ByteCache: Send + Sync {
    /// Get a copy of the cached bytes, if any.
    fn get(&self, name: &str) -> Option<Vec<u8>>;

    /// Store bytes under the given name, replacing any previous entry.
    fn put(&self, name: &str, data: Vec<u8>);

    /// Remove an entry.
    fn remove(&self, name: &str);

    /// Remove every entry.
    fn clear(&self);
}

/// A cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ByteCache for NoCache {
    fn get(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }

    fn put(&self, _name: &str, _data: Vec<u8>) {}

    fn remove(&self, _name: &str) {}

    fn clear(&self) {}
}

/// An in-memory byte cache.
///
/// When a size limit is set and exceeded, the oldest entries are evicted
/// first. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<RwLock<MemoryCacheInner>>,
    max_size: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryCacheInner {
    entries: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
    current_size: usize,
}

impl MemoryCacheInner {
    fn remove(&mut self, name: &str) {
        if let Some(old) = self.entries.remove(name) {
            self.current_size -= old.len();
            self.order.retain(|k| k != name);
        }
    }
}

impl MemoryCache {
    /// Create a memory cache with no size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory cache holding at most `max_size` bytes.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            inner: Arc::default(),
            max_size: Some(max_size),
        }
    }

    /// Total size of the cached data in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.read().current_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ByteCache for MemoryCache {
    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.read().entries.get(name).cloned()
    }

    fn put(&self, name: &str, data: Vec<u8>) {
        let mut cache = self.inner.write();
        cache.remove(name);

        if let Some(max_size) = self.max_size {
            if data.len() > max_size {
                return;
            }
            while cache.current_size + data.len() > max_size {
                let Some(oldest) = cache.order.pop_front() else {
                    break;
                };
                if let Some(old) = cache.entries.remove(&oldest) {
                    cache.current_size -= old.len();
                }
            }
        }

        cache.current_size += data.len();
        cache.entries.insert(name.to_string(), data);
        cache.order.push_back(name.to_string());
    }

    fn remove(&self, name: &str) {
        self.inner.write().remove(name);
    }

    fn clear(&self) {
        let mut cache = self.inner.write();
        cache.entries.clear();
        cache.order.clear();
        cache.current_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cache() {
        let cache = NoCache;
        cache.put("http://example.com", vec![1, 2, 3]);
        assert!(cache.get("http://example.com").is_none());
    }

    #[test]
    fn test_memory_cache_basic() {
        let cache = MemoryCache::new();
        assert!(cache.is_empty());

        cache.put("http://example.com/a", vec![1, 2, 3]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 3);
        assert_eq!(cache.get("http://example.com/a"), Some(vec![1, 2, 3]));
        assert!(cache.get("http://example.com/b").is_none());

        cache.remove("http://example.com/a");
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_memory_cache_evicts_oldest() {
        let cache = MemoryCache::with_max_size(10);
        cache.put("http://a", vec![1, 2, 3, 4, 5]);
        cache.put("http://b", vec![6, 7, 8, 9, 10]);
        assert_eq!(cache.size(), 10);

        cache.put("http://c", vec![11, 12, 13]);
        assert_eq!(cache.size(), 8);
        assert!(cache.get("http://a").is_none());
        assert!(cache.get("http://b").is_some());
        assert!(cache.get("http://c").is_some());
    }

    #[test]
    fn test_memory_cache_skips_oversized_entries() {
        let cache = MemoryCache::with_max_size(4);
        cache.put("http://a", vec![1, 2]);
        cache.put("http://huge", vec![0; 16]);
        assert!(cache.get("http://huge").is_none());
        assert!(cache.get("http://a").is_some());
    }

    #[test]
    fn test_memory_cache_replace_and_clear() {
        let cache = MemoryCache::new();
        cache.put("http://a", vec![1, 2, 3]);
        cache.put("http://a", vec![1, 2, 3, 4, 5]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 5);

        let shared = cache.clone();
        shared.clear();
        assert!(cache.is_empty());
    }
}
