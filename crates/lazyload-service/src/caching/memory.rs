use lru::LruCache;

/// Byte accounting and recency order of the decoded artifacts held in memory.
///
/// The cache tracks the size of every resident artifact and keeps `current_size` between two
/// watermarks: once an insertion brings it to or above the upper limit, the least recently
/// touched entries are evicted until it is at or below the lower limit.
///
/// Only URLs and sizes are stored here. The artifacts themselves live in the request table, which
/// is expected to drop every URL this cache reports as evicted.
#[derive(Debug)]
pub struct MemoryCache {
    entries: LruCache<String, u64>,
    current_size: u64,
    upper_limit: u64,
    lower_limit: u64,
}

impl MemoryCache {
    /// Creates an empty cache. A lower limit above the upper limit is clamped to it.
    pub fn new(upper_limit: u64, lower_limit: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            current_size: 0,
            upper_limit,
            lower_limit: lower_limit.min(upper_limit),
        }
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn upper_limit(&self) -> u64 {
        self.upper_limit
    }

    pub fn lower_limit(&self) -> u64 {
        self.lower_limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains(url)
    }

    /// Marks `url` as most recently used. Returns `false` if it is not resident.
    pub fn touch(&mut self, url: &str) -> bool {
        self.entries.get(url).is_some()
    }

    /// Adds an artifact of `size` bytes as the most recently used entry.
    ///
    /// Returns the URLs evicted to get back under the budget. This may include `url` itself if
    /// the artifact alone does not fit below the lower limit.
    pub fn insert(&mut self, url: String, size: u64) -> Vec<String> {
        if let Some(previous) = self.entries.put(url, size) {
            self.current_size -= previous;
        }
        self.current_size += size;
        self.purge_if_needed()
    }

    /// Removes `url`, returning the size it accounted for.
    pub fn remove(&mut self, url: &str) -> Option<u64> {
        let size = self.entries.pop(url)?;
        self.current_size -= size;
        Some(size)
    }

    /// Runs [`evict`](Self::evict) if the cache is at or above its upper limit.
    pub fn purge_if_needed(&mut self) -> Vec<String> {
        if self.current_size >= self.upper_limit {
            self.evict()
        } else {
            Vec::new()
        }
    }

    /// Evicts least recently used entries until the cache is at or below its lower limit.
    ///
    /// Eviction stops as soon as the bound holds, so no more entries than necessary are removed.
    pub fn evict(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.current_size > self.lower_limit {
            let Some((url, size)) = self.entries.pop_lru() else {
                break;
            };
            self.current_size -= size;
            evicted.push(url);
        }
        if !evicted.is_empty() {
            tracing::debug!(
                evicted = evicted.len(),
                current_size = self.current_size,
                "Purged memory cache"
            );
            metric!(counter("loader.evicted") += evicted.len() as i64);
        }
        evicted
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }
}
