//! LRU (Least Recently Used) cache implementation.

use crate::types::PageIndex;
use std::collections::HashMap;

/// Tracks page access order for eviction.
pub struct LruCache {
    positions: HashMap<PageIndex, usize>,
    order: Vec<LruNode>,
    head: Option<usize>,
    tail: Option<usize>,
    free_slots: Vec<usize>,
}

#[derive(Clone, Copy)]
struct LruNode {
    page_index: PageIndex,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            positions: HashMap::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            free_slots: Vec::new(),
        }
    }

    /// Record access to a page (moves it to front).
    pub fn access(&mut self, page_index: PageIndex) {
        if let Some(&pos) = self.positions.get(&page_index) {
            self.move_to_front(pos);
        } else {
            self.insert(page_index);
        }
    }

    pub fn remove(&mut self, page_index: PageIndex) {
        if let Some(pos) = self.positions.remove(&page_index) {
            self.unlink(pos);
            self.free_slots.push(pos);
        }
    }

    pub fn lru(&self) -> Option<PageIndex> {
        self.tail.map(|pos| self.order[pos].page_index)
    }

    pub fn pop_lru(&mut self) -> Option<PageIndex> {
        let page_index = self.lru()?;
        self.remove(page_index);
        Some(page_index)
    }

    fn insert(&mut self, page_index: PageIndex) {
        let pos = if let Some(pos) = self.free_slots.pop() {
            self.order[pos] = LruNode {
                page_index,
                prev: None,
                next: self.head,
            };
            pos
        } else {
            let pos = self.order.len();
            self.order.push(LruNode {
                page_index,
                prev: None,
                next: self.head,
            });
            pos
        };

        if let Some(old_head) = self.head {
            self.order[old_head].prev = Some(pos);
        }
        self.head = Some(pos);
        if self.tail.is_none() {
            self.tail = Some(pos);
        }
        self.positions.insert(page_index, pos);
    }

    fn move_to_front(&mut self, pos: usize) {
        if self.head == Some(pos) {
            return;
        }
        self.unlink(pos);
        self.order[pos].prev = None;
        self.order[pos].next = self.head;
        if let Some(old_head) = self.head {
            self.order[old_head].prev = Some(pos);
        }
        self.head = Some(pos);
        if self.tail.is_none() {
            self.tail = Some(pos);
        }
    }

    fn unlink(&mut self, pos: usize) {
        let node = self.order[pos];
        if let Some(prev) = node.prev {
            self.order[prev].next = node.next;
        } else {
            self.head = node.next;
        }
        if let Some(next) = node.next {
            self.order[next].prev = node.prev;
        } else {
            self.tail = node.prev;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.positions.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut cache = LruCache::new(3);
        cache.access(PageIndex::new(1));
        cache.access(PageIndex::new(2));
        cache.access(PageIndex::new(3));
        assert_eq!(cache.lru(), Some(PageIndex::new(1)));

        cache.access(PageIndex::new(1));
        assert_eq!(cache.lru(), Some(PageIndex::new(2)));

        assert_eq!(cache.pop_lru(), Some(PageIndex::new(2)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn remove_updates_lru() {
        let mut cache = LruCache::new(3);
        cache.access(PageIndex::new(1));
        cache.access(PageIndex::new(2));
        cache.access(PageIndex::new(3));

        cache.remove(PageIndex::new(2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lru(), Some(PageIndex::new(1)));

        cache.pop_lru();
        assert_eq!(cache.lru(), Some(PageIndex::new(3)));
    }

    #[test]
    fn empty_cache_has_no_lru() {
        let mut cache = LruCache::new(3);
        assert!(cache.is_empty());
        assert_eq!(cache.lru(), None);
        assert_eq!(cache.pop_lru(), None);
    }
}
