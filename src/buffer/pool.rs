//! Buffer pool for B+Tree node pages (spec.md §4.4).
//!
//! Caches decoded [`SlottedPage`]s in memory, pinning pages while a guard is
//! held and evicting the least-recently-used unpinned page when the pool is
//! full. The free-space map and blob allocator go straight to the
//! [`PageStore`] — they're accessed too irregularly to benefit from this
//! cache, and never overlap with the access method's own pages.

use crate::buffer::lru::LruCache;
use crate::error::{Result, StorageError};
use crate::page::SlottedPage;
use crate::storage::PageStore;
use crate::types::PageIndex;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// Cache of B+Tree node pages over a [`PageStore`].
pub trait BufferPool: Send + Sync {
    fn fetch_page(&self, index: PageIndex) -> Result<PageGuard<'_>>;
    fn fetch_page_mut(&self, index: PageIndex) -> Result<PageGuardMut<'_>>;

    /// Register a freshly-allocated page (its index already reserved via
    /// the free-space map or [`PageStore::create_page`]) as a pinned,
    /// dirty cache entry.
    fn insert_new(&self, index: PageIndex, page: SlottedPage) -> Result<PageGuardMut<'_>>;

    fn flush_page(&self, index: PageIndex) -> Result<()>;
    fn flush_all(&self) -> Result<()>;

    /// Drop a page from the cache without writing it back (used once the
    /// free-space map has reclaimed the page).
    fn evict(&self, index: PageIndex);

    fn capacity(&self) -> usize;
}

struct BufferFrame {
    page: SlottedPage,
    dirty: bool,
    pin_count: u32,
}

/// Buffer pool implementation backed by an LRU eviction policy.
pub struct BufferPoolImpl {
    store: Arc<dyn PageStore>,
    frames: RwLock<HashMap<PageIndex, Arc<RwLock<BufferFrame>>>>,
    lru: RwLock<LruCache>,
    capacity: usize,
}

impl BufferPoolImpl {
    pub fn new(store: Arc<dyn PageStore>, capacity: usize) -> Self {
        Self {
            store,
            frames: RwLock::new(HashMap::with_capacity(capacity)),
            lru: RwLock::new(LruCache::new(capacity)),
            capacity,
        }
    }

    fn get_frame(&self, index: PageIndex) -> Result<Arc<RwLock<BufferFrame>>> {
        {
            let frames = self.frames.read();
            if let Some(frame) = frames.get(&index) {
                self.lru.write().access(index);
                return Ok(Arc::clone(frame));
            }
        }
        self.load_page(index)
    }

    fn load_page(&self, index: PageIndex) -> Result<Arc<RwLock<BufferFrame>>> {
        let page_buf = self.store.fetch_page(index)?;
        let page = SlottedPage::from_bytes(page_buf.as_bytes(), self.store.page_size() as usize)?;

        if self.frames.read().len() >= self.capacity {
            self.evict_one()?;
        }

        let frame = Arc::new(RwLock::new(BufferFrame {
            page,
            dirty: false,
            pin_count: 0,
        }));
        self.frames.write().insert(index, Arc::clone(&frame));
        self.lru.write().access(index);
        log::trace!("buffer pool: loaded page {index} from disk");
        Ok(frame)
    }

    fn evict_one(&self) -> Result<()> {
        let mut lru = self.lru.write();
        loop {
            let index = lru.pop_lru().ok_or_else(|| {
                StorageError::invalid_operation("buffer pool exhausted: every cached page is pinned")
            })?;

            let frames = self.frames.read();
            let Some(frame) = frames.get(&index) else {
                continue;
            };
            let pinned = frame.read().pin_count > 0;
            if pinned {
                drop(frames);
                lru.access(index);
                continue;
            }
            drop(frames);
            self.write_back(index)?;
            self.frames.write().remove(&index);
            log::trace!("buffer pool: evicted page {index}");
            return Ok(());
        }
    }

    fn write_back(&self, index: PageIndex) -> Result<()> {
        let frames = self.frames.read();
        if let Some(frame) = frames.get(&index) {
            let mut guard = frame.write();
            if guard.dirty {
                self.store.update_page(index, guard.page.as_bytes())?;
                guard.dirty = false;
            }
        }
        Ok(())
    }
}

impl BufferPool for BufferPoolImpl {
    fn fetch_page(&self, index: PageIndex) -> Result<PageGuard<'_>> {
        let frame = self.get_frame(index)?;
        frame.write().pin_count += 1;
        Ok(PageGuard {
            index,
            frame,
            pool: self,
        })
    }

    fn fetch_page_mut(&self, index: PageIndex) -> Result<PageGuardMut<'_>> {
        let frame = self.get_frame(index)?;
        frame.write().pin_count += 1;
        Ok(PageGuardMut {
            index,
            frame,
            pool: self,
        })
    }

    fn insert_new(&self, index: PageIndex, page: SlottedPage) -> Result<PageGuardMut<'_>> {
        if self.frames.read().len() >= self.capacity {
            self.evict_one()?;
        }
        let frame = Arc::new(RwLock::new(BufferFrame {
            page,
            dirty: true,
            pin_count: 1,
        }));
        self.frames.write().insert(index, Arc::clone(&frame));
        self.lru.write().access(index);
        Ok(PageGuardMut {
            index,
            frame,
            pool: self,
        })
    }

    fn flush_page(&self, index: PageIndex) -> Result<()> {
        self.write_back(index)
    }

    fn flush_all(&self) -> Result<()> {
        let indices: Vec<PageIndex> = self.frames.read().keys().copied().collect();
        for index in indices {
            self.write_back(index)?;
        }
        self.store.flush()
    }

    fn evict(&self, index: PageIndex) {
        self.frames.write().remove(&index);
        self.lru.write().remove(index);
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// RAII guard for read access to a cached page.
pub struct PageGuard<'a> {
    index: PageIndex,
    frame: Arc<RwLock<BufferFrame>>,
    pool: &'a BufferPoolImpl,
}

impl<'a> PageGuard<'a> {
    pub fn index(&self) -> PageIndex {
        self.index
    }

    pub fn read(&self) -> PageRef<'_> {
        PageRef {
            guard: self.frame.read(),
        }
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        let mut frame = self.frame.write();
        frame.pin_count = frame.pin_count.saturating_sub(1);
        drop(frame);
        self.pool.lru.write().access(self.index);
    }
}

pub struct PageRef<'a> {
    guard: RwLockReadGuard<'a, BufferFrame>,
}

impl<'a> std::ops::Deref for PageRef<'a> {
    type Target = SlottedPage;

    fn deref(&self) -> &Self::Target {
        &self.guard.page
    }
}

/// RAII guard for write access to a cached page.
pub struct PageGuardMut<'a> {
    index: PageIndex,
    frame: Arc<RwLock<BufferFrame>>,
    pool: &'a BufferPoolImpl,
}

impl<'a> PageGuardMut<'a> {
    pub fn index(&self) -> PageIndex {
        self.index
    }

    pub fn write(&self) -> PageRefMut<'_> {
        let mut guard = self.frame.write();
        guard.dirty = true;
        PageRefMut { guard }
    }

    pub fn read(&self) -> PageRef<'_> {
        PageRef {
            guard: self.frame.read(),
        }
    }
}

impl<'a> Drop for PageGuardMut<'a> {
    fn drop(&mut self) {
        let mut frame = self.frame.write();
        frame.pin_count = frame.pin_count.saturating_sub(1);
        drop(frame);
        self.pool.lru.write().access(self.index);
    }
}

pub struct PageRefMut<'a> {
    guard: RwLockWriteGuard<'a, BufferFrame>,
}

impl<'a> std::ops::Deref for PageRefMut<'a> {
    type Target = SlottedPage;

    fn deref(&self) -> &Self::Target {
        &self.guard.page
    }
}

impl<'a> std::ops::DerefMut for PageRefMut<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Cell;
    use crate::storage::FilePageStore;
    use tempfile::tempdir;

    fn new_pool(capacity: usize) -> (tempfile::TempDir, BufferPoolImpl) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn PageStore> =
            Arc::new(FilePageStore::create_new(&dir.path().join("pool.db"), 4096, false).unwrap());
        let pool = BufferPoolImpl::new(Arc::clone(&store), capacity);
        (dir, pool)
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let (_dir, pool) = new_pool(10);
        let index = PageIndex::new(0);
        let mut page = SlottedPage::new_leaf(4096);
        page.insert_cell(&Cell::new_leaf_inline(b"hello".to_vec(), b"world".to_vec()))
            .unwrap();
        pool.insert_new(index, page).unwrap();
        pool.flush_all().unwrap();

        let guard = pool.fetch_page(index).unwrap();
        let cell = guard.read().get_cell(0).unwrap();
        assert_eq!(cell.key(), b"hello");
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let (_dir, pool) = new_pool(1);
        let page0 = SlottedPage::new_leaf(4096);
        pool.insert_new(PageIndex::new(0), page0).unwrap();
        drop(pool.fetch_page_mut(PageIndex::new(0)).unwrap());

        let page1 = SlottedPage::new_leaf(4096);
        pool.insert_new(PageIndex::new(1), page1).unwrap();

        let guard = pool.fetch_page(PageIndex::new(0)).unwrap();
        assert!(guard.read().cell_count() == 0);
    }
}
