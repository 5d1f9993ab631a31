//! Page cache shared by every file chunk.
//!
//! Pages are keyed by `(chunk_id, page_index)` and handed out as
//! [`PageHandle`]s. A handle holds a reference on its page; dropping it
//! releases the reference. Pages with no references sit on an LRU free
//! list. When the cache is over capacity, released pages are evicted right
//! away and loads recycle the buffer of the least recently released page
//! instead of allocating. A page with a positive reference count is never
//! evicted.
//!
//! A single mutex guards the hash index, the free list and the size
//! counter. Page I/O happens outside the lock.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use super::page::Page;
use super::types::ChunkId;
use crate::error::Result;

pub type PageKey = (ChunkId, u32);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub pages: usize,
    pub free_pages: usize,
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub recycled: usize,
}

struct CacheEntry {
    page: Arc<Page>,
    refs: usize,
    size: usize,
}

struct CacheState {
    entries: HashMap<PageKey, CacheEntry>,
    free: LruCache<PageKey, ()>,
    size: usize,
    shut_down: bool,
}

pub struct PageCache {
    max_size: usize,
    state: Mutex<CacheState>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    recycled: AtomicUsize,
}

impl PageCache {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            max_size,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                free: LruCache::unbounded(),
                size: 0,
                shut_down: false,
            }),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        Ok(self.state.lock()?)
    }

    /// Takes a reference on a cached page, pulling it off the free list.
    pub fn acquire(self: &Arc<Self>, key: PageKey) -> Result<Option<PageHandle>> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(&key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        entry.refs += 1;
        let page = Arc::clone(&entry.page);
        if entry.refs == 1 {
            state.free.pop(&key);
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(self.handle(key, page)))
    }

    /// Returns a zeroed buffer of `len` bytes for a page load. When the cache
    /// is full the least recently released page is evicted and its buffer
    /// reused.
    pub fn allocate(&self, len: usize) -> Result<Vec<u8>> {
        let recycled = {
            let mut state = self.lock()?;
            if state.size + len > self.max_size {
                self.evict_lru(&mut state)
            } else {
                None
            }
        };

        match recycled {
            Some(page) => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                let mut buf = page.into_buffer();
                buf.clear();
                buf.resize(len, 0);
                Ok(buf)
            }
            None => Ok(vec![0u8; len]),
        }
    }

    /// Registers a freshly loaded page and returns a referenced handle. If
    /// another reader inserted the same page first, that copy is returned.
    pub fn insert(self: &Arc<Self>, key: PageKey, page: Page) -> Result<PageHandle> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if state.shut_down {
            return Ok(PageHandle::detached(page));
        }

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.refs += 1;
            let existing = Arc::clone(&entry.page);
            if entry.refs == 1 {
                state.free.pop(&key);
            }
            return Ok(self.handle(key, existing));
        }

        let size = page.memory_size();
        while state.size + size > self.max_size {
            if self.evict_lru(state).is_none() {
                break;
            }
        }

        let page = Arc::new(page);
        state.entries.insert(
            key,
            CacheEntry {
                page: Arc::clone(&page),
                refs: 1,
                size,
            },
        );
        state.size += size;
        Ok(self.handle(key, page))
    }

    fn handle(self: &Arc<Self>, key: PageKey, page: Arc<Page>) -> PageHandle {
        PageHandle {
            key,
            page,
            cache: Some(Arc::clone(self)),
        }
    }

    fn release(&self, key: PageKey) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let over_capacity = state.size > self.max_size;
        let Some(entry) = state.entries.get_mut(&key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        if over_capacity || state.shut_down {
            self.remove(state, key);
        } else {
            state.free.put(key, ());
        }
    }

    fn evict_lru(&self, state: &mut CacheState) -> Option<Page> {
        let (key, ()) = state.free.pop_lru()?;
        self.remove(state, key)
    }

    fn remove(&self, state: &mut CacheState, key: PageKey) -> Option<Page> {
        state.free.pop(&key);
        let entry = state.entries.remove(&key)?;
        state.size -= entry.size;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Arc::try_unwrap(entry.page).ok()
    }

    /// Sheds unreferenced pages down to three quarters of the capacity.
    /// Called by long scans so they do not fill the cache with pages they
    /// will not revisit.
    pub fn try_unload_pages(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let target = self.max_size / 4 * 3;
        let mut unloaded = 0;
        while state.size > target {
            if self.evict_lru(&mut state).is_none() {
                break;
            }
            unloaded += 1;
        }
        Ok(unloaded)
    }

    /// Drops every unreferenced page of a deleted chunk.
    pub fn evict_chunk(&self, chunk_id: ChunkId) -> Result<usize> {
        let mut state = self.lock()?;
        let keys: Vec<PageKey> = state
            .entries
            .iter()
            .filter(|(key, entry)| key.0 == chunk_id && entry.refs == 0)
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            self.remove(&mut state, *key);
        }
        Ok(keys.len())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let state = self.lock()?;
        Ok(CacheStats {
            size: state.size,
            pages: state.entries.len(),
            free_pages: state.free.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        })
    }

    /// Drops all unreferenced pages. Pages still referenced are dropped on
    /// release and nothing new is cached afterwards.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.shut_down = true;
        while self.evict_lru(&mut state).is_some() {}
        tracing::debug!(remaining = state.entries.len(), "Page cache shut down");
        Ok(())
    }
}

/// A referenced page. Detached handles come from chunks that are not on
/// disk yet and are not tracked by the cache.
pub struct PageHandle {
    key: PageKey,
    page: Arc<Page>,
    cache: Option<Arc<PageCache>>,
}

impl PageHandle {
    pub fn detached(page: Page) -> Self {
        Self::shared(Arc::new(page))
    }

    /// An untracked handle on a page owned elsewhere.
    pub fn shared(page: Arc<Page>) -> Self {
        Self {
            key: (0, 0),
            page,
            cache: None,
        }
    }

    pub fn key(&self) -> PageKey {
        self.key
    }
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            cache.release(self.key);
        }
    }
}
