//! Page cache for the store engine.
//!
//! The cache stores recently decrypted pages to avoid repeated reads and
//! AEAD verification. Uses clock eviction (approximate LRU) for low overhead.
//!
//! Only committed page images are cached. Uncommitted writes stay in the
//! writer's dirty set, so every entry can be evicted at any time.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::Page;
use crate::error::PageId;

/// Page cache with clock eviction.
///
/// Tracks hit/miss counters for observability. A capacity of zero disables
/// caching.
pub struct PageCache {
    inner: Mutex<ClockState>,
    /// Maximum number of pages to cache.
    capacity: usize,
    /// Total cache hits since creation.
    hits: AtomicU64,
    /// Total cache misses since creation.
    misses: AtomicU64,
}

#[derive(Default)]
struct ClockState {
    pages: HashMap<PageId, CacheEntry>,
    /// Order of pages for the clock sweep.
    order: Vec<PageId>,
    hand: usize,
}

/// Cache entry with access tracking.
struct CacheEntry {
    page: Page,
    /// Whether page was accessed since last clock sweep (second chance).
    accessed: bool,
}

impl ClockState {
    fn evict_one(&mut self) {
        // Every entry gets at most one second chance, so two sweeps suffice.
        for _ in 0..self.order.len() * 2 {
            if self.hand >= self.order.len() {
                self.hand = 0;
            }
            let page_id = self.order[self.hand];
            match self.pages.get_mut(&page_id) {
                Some(entry) if entry.accessed => {
                    entry.accessed = false;
                    self.hand += 1;
                },
                _ => {
                    self.pages.remove(&page_id);
                    self.order.remove(self.hand);
                    return;
                },
            }
        }
    }
}

impl PageCache {
    /// Creates a new cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ClockState::default()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a clone of the cached page, or `None` if not present.
    pub fn get(&self, page_id: PageId) -> Option<Page> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.pages.get_mut(&page_id) {
            entry.accessed = true;
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.page.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Inserts or replaces a committed page image.
    pub fn insert(&self, page: Page) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.pages.get_mut(&page.id) {
            entry.page = page;
            entry.accessed = true;
            return;
        }

        if inner.pages.len() >= self.capacity {
            inner.evict_one();
        }

        inner.order.push(page.id);
        inner.pages.insert(page.id, CacheEntry { page, accessed: true });
    }

    /// Removes a page from the cache.
    pub fn remove(&self, page_id: PageId) -> Option<Page> {
        let mut inner = self.inner.lock();
        let entry = inner.pages.remove(&page_id)?;
        if let Some(pos) = inner.order.iter().position(|&id| id == page_id) {
            inner.order.remove(pos);
        }
        Some(entry.page)
    }

    /// Clears all cached pages.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pages.clear();
        inner.order.clear();
        inner.hand = 0;
    }

    /// Returns the number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Checks if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if a page is in the cache.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().pages.contains_key(&page_id)
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of cached pages.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::PageType;

    fn make_page(id: PageId) -> Page {
        Page::new(id, 512, PageType::BTreeLeaf, 1)
    }

    #[test]
    fn test_cache_basic() {
        let cache = PageCache::new(10);

        cache.insert(make_page(0));
        assert!(cache.contains(0));
        assert!(cache.get(0).is_some());

        cache.remove(0);
        assert!(!cache.contains(0));
        assert!(cache.get(0).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_cache_eviction_at_capacity() {
        let cache = PageCache::new(3);

        cache.insert(make_page(0));
        cache.insert(make_page(1));
        cache.insert(make_page(2));
        assert_eq!(cache.len(), 3);

        cache.insert(make_page(3));
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(3));
    }

    #[test]
    fn test_cache_second_chance() {
        let cache = PageCache::new(3);

        cache.insert(make_page(0));
        cache.insert(make_page(1));
        cache.insert(make_page(2));

        // First sweep clears every accessed bit and evicts page 0; page 1
        // is the next candidate unless touched.
        cache.insert(make_page(3));
        assert!(!cache.contains(0));

        cache.get(1);
        cache.insert(make_page(4));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn test_insert_replaces_existing() {
        let cache = PageCache::new(2);
        cache.insert(make_page(5));
        let mut updated = make_page(5);
        updated.content_mut()[0] = 0xAB;
        cache.insert(updated.clone());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(5).unwrap(), updated);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = PageCache::new(0);
        cache.insert(make_page(1));
        assert!(cache.is_empty());
    }

    #[test]
    fn stress_concurrent_cache_access_with_eviction() {
        use std::{sync::Arc, thread};

        let cache = Arc::new(PageCache::new(50));
        let num_threads = 10;
        let ops_per_thread = 200;

        let handles: Vec<_> = (0..num_threads)
            .map(|thread_id| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..ops_per_thread {
                        let page_id = (thread_id * ops_per_thread + i) as PageId;
                        cache.insert(make_page(page_id));
                        if i > 0 {
                            let _ = cache.get(page_id - 1);
                        }
                        if i % 5 == 0 && i > 10 {
                            let _ = cache.remove(page_id - 10);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        let stats = cache.stats();
        assert!(stats.size <= stats.capacity);
        assert!(stats.hits + stats.misses > 0);
    }
}
