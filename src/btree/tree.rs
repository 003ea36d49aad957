//! B+Tree access method core (spec.md §4.5).
//!
//! Keys live only in leaves alongside their values; interior nodes hold
//! separator keys and child pointers. Every node, leaf or interior, is
//! doubly linked to its siblings at the same level via
//! `previous_page_index`/`next_page_index` so range scans and the
//! supplemented `min_key`/`max_key`/`previous_key`/`next_key` operations
//! never need to climb back through a parent.

use crate::btree::node;
use crate::buffer::{BufferPool, BufferPoolImpl};
use crate::error::Result;
use crate::page::{Cell, SlottedPage, ValueRef};
use crate::storage::blob;
use crate::storage::page_store::PageStore;
use crate::types::{max_inline_value_size, max_key_size, FsmClass, PageIndex, SizeClass};
use crate::storage::fsm;
use crate::error::StorageError;
use std::sync::Arc;

/// B+Tree access method over a paged file (spec.md §4.5).
pub struct BPlusTree {
    store: Arc<dyn PageStore>,
    buffer_pool: Arc<BufferPoolImpl>,
    fsm_root: PageIndex,
    page_size: u32,
    root: PageIndex,
}

impl BPlusTree {
    /// Attach to a tree whose root is `root` (`PageIndex::INVALID` for an
    /// empty tree — spec.md §3: the heading page's
    /// `AccessMethodPageIndex` starts out invalid).
    pub fn new(store: Arc<dyn PageStore>, buffer_pool: Arc<BufferPoolImpl>, fsm_root: PageIndex, root: PageIndex) -> Self {
        let page_size = store.page_size();
        Self {
            store,
            buffer_pool,
            fsm_root,
            page_size,
            root,
        }
    }

    pub fn root(&self) -> PageIndex {
        self.root
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.root.is_valid() {
            return Ok(None);
        }
        let mut current = self.root;
        loop {
            let guard = self.buffer_pool.fetch_page(current)?;
            let page = guard.read();
            if page.is_leaf() {
                return match page.search(key)? {
                    Some(idx) => {
                        let cell = page.get_cell(idx)?;
                        drop(page);
                        drop(guard);
                        Ok(Some(self.resolve_value(&cell)?))
                    }
                    None => Ok(None),
                };
            }
            let child = page.find_child(key)?;
            drop(page);
            drop(guard);
            current = child;
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        if !self.root.is_valid() {
            return Ok(false);
        }
        let mut current = self.root;
        loop {
            let guard = self.buffer_pool.fetch_page(current)?;
            let page = guard.read();
            if page.is_leaf() {
                return Ok(page.search(key)?.is_some());
            }
            let child = page.find_child(key)?;
            drop(page);
            drop(guard);
            current = child;
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let max_key = max_key_size(self.page_size);
        if key.len() > max_key {
            return Err(StorageError::KeyTooLarge {
                size: key.len(),
                max: max_key,
            });
        }

        if !self.root.is_valid() {
            let (index, mut page) = self.alloc_node(true)?;
            let cell = self.make_leaf_cell(key, value)?;
            page.insert_cell(&cell)?;
            self.sync_fsm_class(index, &page)?;
            self.buffer_pool.insert_new(index, page)?;
            self.root = index;
            return Ok(());
        }

        if let Some((separator, new_child)) = self.insert_recursive(self.root, key, value)? {
            self.split_root(separator, new_child)?;
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        if !self.root.is_valid() {
            return Ok(false);
        }
        let deleted = self.delete_recursive(self.root, key)?;
        if deleted {
            self.collapse_root_if_needed(self.root)?;
        }
        Ok(deleted)
    }

    pub fn count(&self) -> Result<u64> {
        if !self.root.is_valid() {
            return Ok(0);
        }
        let mut current = self.leftmost_leaf(self.root)?;
        let mut total = 0u64;
        loop {
            let guard = self.buffer_pool.fetch_page(current)?;
            let page = guard.read();
            total += page.cell_count() as u64;
            let next = page.header().next_page_index;
            drop(page);
            drop(guard);
            if !next.is_valid() {
                break;
            }
            current = next;
        }
        Ok(total)
    }

    pub fn min_key(&self) -> Result<Option<Vec<u8>>> {
        if !self.root.is_valid() {
            return Ok(None);
        }
        let leaf = self.leftmost_leaf(self.root)?;
        let guard = self.buffer_pool.fetch_page(leaf)?;
        let page = guard.read();
        if page.cell_count() == 0 {
            return Ok(None);
        }
        Ok(Some(page.get_cell(0)?.key().to_vec()))
    }

    pub fn max_key(&self) -> Result<Option<Vec<u8>>> {
        if !self.root.is_valid() {
            return Ok(None);
        }
        let leaf = self.rightmost_leaf(self.root)?;
        let guard = self.buffer_pool.fetch_page(leaf)?;
        let page = guard.read();
        let count = page.cell_count();
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(page.get_cell(count - 1)?.key().to_vec()))
    }

    /// Smallest key strictly greater than `key`.
    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.root.is_valid() {
            return Ok(None);
        }
        let (leaf, idx) = self.locate_lower_bound(self.root, key)?;
        let mut idx = match idx {
            Some(idx) => idx,
            // Every cell in this leaf sorts before `key`; the answer, if
            // any, is the first cell of a following leaf.
            None => {
                let cell_count = self.buffer_pool.fetch_page(leaf)?.read().cell_count();
                return self.key_at_or_after(leaf, cell_count);
            }
        };
        let at_key = {
            let guard = self.buffer_pool.fetch_page(leaf)?;
            guard.read().get_cell(idx)?.key() == key
        };
        if at_key {
            idx += 1;
        }
        self.key_at_or_after(leaf, idx)
    }

    /// Largest key strictly less than `key`.
    pub fn previous_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.root.is_valid() {
            return Ok(None);
        }
        let (leaf, idx) = self.locate_lower_bound(self.root, key)?;
        match idx {
            Some(0) => self.key_before(leaf, 0),
            Some(idx) => {
                let guard = self.buffer_pool.fetch_page(leaf)?;
                let page = guard.read();
                let cell = page.get_cell(idx - 1)?;
                Ok(Some(cell.key().to_vec()))
            }
            // Every cell in this leaf sorts before `key`; the answer is
            // this leaf's own last key, not the tree's global maximum.
            None => {
                let cell_count = self.buffer_pool.fetch_page(leaf)?.read().cell_count();
                self.key_before(leaf, cell_count)
            }
        }
    }

    pub fn scan(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut results = Vec::new();
        if !self.root.is_valid() {
            return Ok(results);
        }
        let mut current = match start {
            Some(key) => self.descend_to_leaf(self.root, key)?,
            None => self.leftmost_leaf(self.root)?,
        };
        loop {
            let guard = self.buffer_pool.fetch_page(current)?;
            let page = guard.read();
            for i in 0..page.cell_count() {
                let cell = page.get_cell(i)?;
                if let Some(s) = start {
                    if cell.key() < s {
                        continue;
                    }
                }
                if let Some(e) = end {
                    if cell.key() >= e {
                        return Ok(results);
                    }
                }
                let value = self.resolve_value(&cell)?;
                results.push((cell.key().to_vec(), value));
            }
            let next = page.header().next_page_index;
            drop(page);
            drop(guard);
            if !next.is_valid() {
                return Ok(results);
            }
            current = next;
        }
    }

    /// Page-accounting walk for `Storage::stats()` (spec.md §8 property 5):
    /// counts this tree's own node pages and every blob fragment page
    /// reachable from a leaf cell, alongside the live entry count.
    pub fn page_stats(&self) -> Result<(u64, u64, u64)> {
        if !self.root.is_valid() {
            return Ok((0, 0, 0));
        }
        let mut tree_pages = 0u64;
        let mut blob_pages = 0u64;
        let mut entries = 0u64;
        let mut frontier = vec![self.root];
        while let Some(current) = frontier.pop() {
            tree_pages += 1;
            let guard = self.buffer_pool.fetch_page(current)?;
            let page = guard.read();
            if page.is_leaf() {
                for i in 0..page.cell_count() {
                    entries += 1;
                    if let Cell::Leaf {
                        value: ValueRef::Blob { start_page_index, .. },
                        ..
                    } = page.get_cell(i)?
                    {
                        blob_pages += blob::count_fragments(self.store.as_ref(), start_page_index)?;
                    }
                }
            } else {
                frontier.push(page.first_child());
                for i in 0..page.cell_count() {
                    if let Cell::Interior { child, .. } = page.get_cell(i)? {
                        frontier.push(child);
                    }
                }
            }
        }
        Ok((tree_pages, blob_pages, entries))
    }

    /// Open a streaming cursor over `[start, end)`, the incremental
    /// counterpart to [`Self::scan`] for callers that don't want the whole
    /// range materialized at once.
    pub fn cursor(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<super::Cursor> {
        if !self.root.is_valid() {
            return Ok(super::Cursor::new(
                Arc::clone(&self.store),
                Arc::clone(&self.buffer_pool),
                PageIndex::INVALID,
                start.map(|s| s.to_vec()),
                end.map(|e| e.to_vec()),
            ));
        }
        let leaf = match start {
            Some(key) => self.descend_to_leaf(self.root, key)?,
            None => self.leftmost_leaf(self.root)?,
        };
        Ok(super::Cursor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.buffer_pool),
            leaf,
            start.map(|s| s.to_vec()),
            end.map(|e| e.to_vec()),
        ))
    }

    // ---- descent helpers ----

    fn leftmost_leaf(&self, mut current: PageIndex) -> Result<PageIndex> {
        loop {
            let guard = self.buffer_pool.fetch_page(current)?;
            let page = guard.read();
            if page.is_leaf() {
                return Ok(current);
            }
            let next = page.first_child();
            drop(page);
            drop(guard);
            current = next;
        }
    }

    fn rightmost_leaf(&self, mut current: PageIndex) -> Result<PageIndex> {
        loop {
            let guard = self.buffer_pool.fetch_page(current)?;
            let page = guard.read();
            if page.is_leaf() {
                return Ok(current);
            }
            let count = page.cell_count();
            let next = if count == 0 {
                page.first_child()
            } else {
                match page.get_cell(count - 1)? {
                    Cell::Interior { child, .. } => child,
                    Cell::Leaf { .. } => unreachable!(),
                }
            };
            drop(page);
            drop(guard);
            current = next;
        }
    }

    fn descend_to_leaf(&self, mut current: PageIndex, key: &[u8]) -> Result<PageIndex> {
        loop {
            let guard = self.buffer_pool.fetch_page(current)?;
            let page = guard.read();
            if page.is_leaf() {
                return Ok(current);
            }
            let child = page.find_child(key)?;
            drop(page);
            drop(guard);
            current = child;
        }
    }

    /// Descend to the leaf that would hold `key`, returning it along with
    /// the index of the first cell whose key is `>= key` (`None` if every
    /// cell in that leaf sorts before it).
    fn locate_lower_bound(&self, root: PageIndex, key: &[u8]) -> Result<(PageIndex, Option<usize>)> {
        let leaf = self.descend_to_leaf(root, key)?;
        let guard = self.buffer_pool.fetch_page(leaf)?;
        let page = guard.read();
        let mut low = 0;
        let mut high = page.cell_count();
        while low < high {
            let mid = low + (high - low) / 2;
            if page.get_cell(mid)?.key() < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low < page.cell_count() {
            Ok((leaf, Some(low)))
        } else {
            Ok((leaf, None))
        }
    }

    /// The key at `idx` in `leaf`, or the first key of a following leaf if
    /// `idx` runs past this leaf's cells.
    fn key_at_or_after(&self, mut leaf: PageIndex, mut idx: usize) -> Result<Option<Vec<u8>>> {
        loop {
            let guard = self.buffer_pool.fetch_page(leaf)?;
            let page = guard.read();
            if idx < page.cell_count() {
                return Ok(Some(page.get_cell(idx)?.key().to_vec()));
            }
            let next = page.header().next_page_index;
            drop(page);
            drop(guard);
            if !next.is_valid() {
                return Ok(None);
            }
            leaf = next;
            idx = 0;
        }
    }

    /// The last key strictly before position `idx` in `leaf` (walking to
    /// the previous leaf's tail when `idx == 0`).
    fn key_before(&self, leaf: PageIndex, idx: usize) -> Result<Option<Vec<u8>>> {
        if idx > 0 {
            let guard = self.buffer_pool.fetch_page(leaf)?;
            let page = guard.read();
            return Ok(Some(page.get_cell(idx - 1)?.key().to_vec()));
        }
        let guard = self.buffer_pool.fetch_page(leaf)?;
        let page = guard.read();
        let prev = page.header().previous_page_index;
        drop(page);
        drop(guard);
        if !prev.is_valid() {
            return Ok(None);
        }
        let guard = self.buffer_pool.fetch_page(prev)?;
        let page = guard.read();
        let count = page.cell_count();
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(page.get_cell(count - 1)?.key().to_vec()))
    }

    // ---- value resolution ----

    fn resolve_value(&self, cell: &Cell) -> Result<Vec<u8>> {
        match cell {
            Cell::Leaf { value, .. } => match value {
                ValueRef::Inline(bytes) => Ok(bytes.clone()),
                ValueRef::Blob {
                    start_page_index,
                    size_class,
                    value_len,
                } => {
                    let mut bytes = blob::read_blob(self.store.as_ref(), *start_page_index, *size_class)?;
                    bytes.truncate(*value_len as usize);
                    Ok(bytes)
                }
            },
            Cell::Interior { .. } => Err(StorageError::invalid_operation("interior cell has no value")),
        }
    }

    fn make_leaf_cell(&self, key: &[u8], value: &[u8]) -> Result<Cell> {
        if value.len() <= max_inline_value_size(self.page_size) {
            Ok(Cell::new_leaf_inline(key.to_vec(), value.to_vec()))
        } else {
            let (start, class) = blob::write_blob(self.store.as_ref(), self.fsm_root, value)?;
            Ok(Cell::new_leaf_blob(key.to_vec(), start, class, value.len() as u64))
        }
    }

    // ---- allocation ----

    fn alloc_page_index(&self) -> Result<PageIndex> {
        fsm::find_page(self.store.as_ref(), self.fsm_root, FsmClass::NotUsed)?
            .map(Ok)
            .unwrap_or_else(|| self.store.create_page())
    }

    fn alloc_node(&self, is_leaf: bool) -> Result<(PageIndex, SlottedPage)> {
        let index = self.alloc_page_index()?;
        let page = if is_leaf {
            SlottedPage::new_leaf(self.page_size as usize)
        } else {
            SlottedPage::new_interior(self.page_size as usize)
        };
        Ok((index, page))
    }

    fn sync_fsm_class(&self, index: PageIndex, page: &SlottedPage) -> Result<()> {
        let class = SizeClass::for_free_space(page.free_space(), self.page_size as usize);
        fsm::set_class(self.store.as_ref(), self.fsm_root, index, FsmClass::from_size_class(class))
    }

    fn free_node_page(&self, index: PageIndex) -> Result<()> {
        self.buffer_pool.evict(index);
        fsm::release(self.store.as_ref(), self.fsm_root, index)
    }

    fn reparent_children(&self, new_parent: PageIndex, page: &SlottedPage) -> Result<()> {
        if page.is_leaf() {
            return Ok(());
        }
        let mut children = vec![page.first_child()];
        for cell in page.get_all_cells()? {
            if let Cell::Interior { child, .. } = cell {
                children.push(child);
            }
        }
        for child in children {
            let guard = self.buffer_pool.fetch_page_mut(child)?;
            guard.write().set_parent(new_parent);
        }
        Ok(())
    }

    // ---- insert ----

    fn insert_recursive(&self, page_index: PageIndex, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, PageIndex)>> {
        let is_leaf = self.buffer_pool.fetch_page(page_index)?.read().is_leaf();
        if is_leaf {
            return self.insert_into_leaf(page_index, key, value);
        }
        let child = self.buffer_pool.fetch_page(page_index)?.read().find_child(key)?;
        let propagated = self.insert_recursive(child, key, value)?;
        match propagated {
            Some((separator, new_child)) => self.insert_into_interior(page_index, &separator, new_child),
            None => Ok(None),
        }
    }

    fn insert_into_leaf(&self, page_index: PageIndex, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, PageIndex)>> {
        let cell = self.make_leaf_cell(key, value)?;
        let guard = self.buffer_pool.fetch_page_mut(page_index)?;

        let existing = guard.read().search(key)?;
        if let Some(idx) = existing {
            let old = guard.read().get_cell(idx)?;
            if let Cell::Leaf {
                value: ValueRef::Blob { start_page_index, .. },
                ..
            } = &old
            {
                blob::release_blob(self.store.as_ref(), self.fsm_root, *start_page_index)?;
            }
            {
                let mut page = guard.write();
                page.delete_cell(idx)?;
                page.insert_cell(&cell)?;
            }
            self.sync_fsm_class(page_index, &guard.read())?;
            return Ok(None);
        }

        if guard.read().can_fit(cell.encoded_size()) {
            guard.write().insert_cell(&cell)?;
            self.sync_fsm_class(page_index, &guard.read())?;
            return Ok(None);
        }

        // Split: the existing page keeps the lower half, a freshly
        // allocated sibling takes the upper half and is linked in after it.
        let (new_index, new_page) = {
            let mut page = guard.write();
            let (mut new_page, separator) = page.split()?;
            if cell.key() < separator.as_slice() {
                page.insert_cell(&cell)?;
            } else {
                new_page.insert_cell(&cell)?;
            }
            let new_index = self.alloc_page_index()?;

            new_page.set_parent(page.header().parent_page_index);
            new_page.set_previous(page_index);
            new_page.set_next(page.header().next_page_index);
            page.set_next(new_index);
            (new_index, new_page)
        };

        let old_next = new_page.header().next_page_index;
        if old_next.is_valid() {
            let guard = self.buffer_pool.fetch_page_mut(old_next)?;
            guard.write().set_previous(new_index);
        }

        self.sync_fsm_class(page_index, &guard.read())?;
        self.sync_fsm_class(new_index, &new_page)?;
        let separator = new_page.get_cell(0)?.key().to_vec();
        self.buffer_pool.insert_new(new_index, new_page)?;

        Ok(Some((separator, new_index)))
    }

    fn insert_into_interior(&self, page_index: PageIndex, separator: &[u8], new_child: PageIndex) -> Result<Option<(Vec<u8>, PageIndex)>> {
        let cell = Cell::new_interior(separator.to_vec(), new_child);
        let guard = self.buffer_pool.fetch_page_mut(page_index)?;

        {
            let parent_guard = self.buffer_pool.fetch_page_mut(new_child)?;
            parent_guard.write().set_parent(page_index);
        }

        if guard.read().can_fit(cell.encoded_size()) {
            guard.write().insert_cell(&cell)?;
            self.sync_fsm_class(page_index, &guard.read())?;
            return Ok(None);
        }

        let (new_index, new_page) = {
            let mut page = guard.write();
            let (mut new_page, up_separator) = page.split()?;
            if cell.key() < up_separator.as_slice() {
                page.insert_cell(&cell)?;
            } else {
                new_page.insert_cell(&cell)?;
            }
            let new_index = self.alloc_page_index()?;

            new_page.set_parent(page.header().parent_page_index);
            new_page.set_previous(page_index);
            new_page.set_next(page.header().next_page_index);
            page.set_next(new_index);
            (new_index, (new_page, up_separator))
        };
        let (new_page, up_separator) = new_page;

        let old_next = new_page.header().next_page_index;
        if old_next.is_valid() {
            let sibling_guard = self.buffer_pool.fetch_page_mut(old_next)?;
            sibling_guard.write().set_previous(new_index);
        }

        self.sync_fsm_class(page_index, &guard.read())?;
        self.reparent_children(new_index, &new_page)?;
        self.sync_fsm_class(new_index, &new_page)?;
        self.buffer_pool.insert_new(new_index, new_page)?;

        Ok(Some((up_separator, new_index)))
    }

    fn split_root(&mut self, separator: Vec<u8>, new_child: PageIndex) -> Result<()> {
        let old_root = self.root;
        let (new_root_index, mut new_root) = self.alloc_node(false)?;
        new_root.set_first_child(old_root);
        new_root.insert_cell(&Cell::new_interior(separator, new_child))?;
        self.sync_fsm_class(new_root_index, &new_root)?;
        self.buffer_pool.insert_new(new_root_index, new_root)?;

        {
            let guard = self.buffer_pool.fetch_page_mut(old_root)?;
            guard.write().set_parent(new_root_index);
        }
        {
            let guard = self.buffer_pool.fetch_page_mut(new_child)?;
            guard.write().set_parent(new_root_index);
        }
        self.root = new_root_index;
        log::debug!("btree: root split, new root page {new_root_index} over old root {old_root}");
        Ok(())
    }

    // ---- delete ----

    fn delete_recursive(&mut self, page_index: PageIndex, key: &[u8]) -> Result<bool> {
        let is_leaf = self.buffer_pool.fetch_page(page_index)?.read().is_leaf();
        if !is_leaf {
            let child = self.buffer_pool.fetch_page(page_index)?.read().find_child(key)?;
            return self.delete_recursive(child, key);
        }

        let guard = self.buffer_pool.fetch_page_mut(page_index)?;
        let Some(idx) = guard.read().search(key)? else {
            return Ok(false);
        };
        let old = guard.read().get_cell(idx)?;
        if let Cell::Leaf {
            value: ValueRef::Blob { start_page_index, .. },
            ..
        } = &old
        {
            blob::release_blob(self.store.as_ref(), self.fsm_root, *start_page_index)?;
        }
        guard.write().delete_cell(idx)?;
        self.sync_fsm_class(page_index, &guard.read())?;
        drop(guard);

        self.fix_underflow(page_index)?;
        Ok(true)
    }

    /// Walk from `index` up towards the root, redistributing or merging
    /// any underflowing node with a sibling (spec.md §4.5).
    fn fix_underflow(&mut self, mut index: PageIndex) -> Result<()> {
        loop {
            if index == self.root {
                return Ok(());
            }
            let (underflow, parent) = {
                let guard = self.buffer_pool.fetch_page(index)?;
                let page = guard.read();
                (node::is_underflow(&page, self.page_size), page.header().parent_page_index)
            };
            if !underflow || !parent.is_valid() {
                return Ok(());
            }
            let merged = self.rebalance(index, parent)?;
            if !merged {
                return Ok(());
            }
            index = parent;
        }
    }

    /// Children of `parent`, in order (`first_child` followed by each
    /// cell's child), alongside the separator keys between them.
    fn parent_children(&self, parent: PageIndex) -> Result<(Vec<PageIndex>, Vec<Vec<u8>>)> {
        let guard = self.buffer_pool.fetch_page(parent)?;
        let page = guard.read();
        let mut children = vec![page.first_child()];
        let mut separators = Vec::new();
        for cell in page.get_all_cells()? {
            if let Cell::Interior { key, child } = cell {
                separators.push(key);
                children.push(child);
            }
        }
        Ok((children, separators))
    }

    fn rebalance(&mut self, index: PageIndex, parent: PageIndex) -> Result<bool> {
        let (children, _) = self.parent_children(parent)?;
        let pos = children
            .iter()
            .position(|&c| c == index)
            .expect("node must be a child of its recorded parent");
        let left = (pos > 0).then(|| children[pos - 1]);
        let right = (pos + 1 < children.len()).then(|| children[pos + 1]);

        if let Some(right_idx) = right {
            if self.try_redistribute_right(index, right_idx, parent, pos)? {
                return Ok(false);
            }
        }
        if let Some(left_idx) = left {
            if self.try_redistribute_left(index, left_idx, parent, pos)? {
                return Ok(false);
            }
        }
        if let Some(left_idx) = left {
            self.merge_nodes(left_idx, index, parent, pos - 1)?;
            return Ok(true);
        }
        if let Some(right_idx) = right {
            self.merge_nodes(index, right_idx, parent, pos)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn try_redistribute_right(&self, target: PageIndex, right: PageIndex, parent: PageIndex, pos: usize) -> Result<bool> {
        let is_leaf = self.buffer_pool.fetch_page(target)?.read().is_leaf();
        let donor_has_spare = {
            let guard = self.buffer_pool.fetch_page(right)?;
            node::has_spare_capacity(&guard.read(), self.page_size)
        };
        if !donor_has_spare {
            return Ok(false);
        }

        if is_leaf {
            let mut borrowed = None;
            {
                let right_guard = self.buffer_pool.fetch_page_mut(right)?;
                let mut right_page = right_guard.write();
                let cell = right_page.delete_cell(0)?;
                borrowed = Some(cell);
            }
            let cell = borrowed.unwrap();
            let new_separator = {
                let right_guard = self.buffer_pool.fetch_page(right)?;
                right_guard.read().get_cell(0)?.key().to_vec()
            };
            let target_guard = self.buffer_pool.fetch_page_mut(target)?;
            target_guard.write().insert_cell(&cell)?;
            self.sync_fsm_class(target, &target_guard.read())?;
            self.sync_fsm_class(right, &self.buffer_pool.fetch_page(right)?.read())?;
            self.set_parent_separator(parent, pos, &new_separator)?;
        } else {
            let separator = {
                let guard = self.buffer_pool.fetch_page(parent)?;
                guard.read().get_cell(pos)?.key().to_vec()
            };
            let (moved_child, new_separator) = {
                let right_guard = self.buffer_pool.fetch_page_mut(right)?;
                let mut right_page = right_guard.write();
                let moved_child = right_page.first_child();
                let first_cell = right_page.delete_cell(0)?;
                let (new_sep, grandchild) = match first_cell {
                    Cell::Interior { key, child } => (key, child),
                    Cell::Leaf { .. } => unreachable!(),
                };
                right_page.set_first_child(grandchild);
                (moved_child, new_sep)
            };
            let target_guard = self.buffer_pool.fetch_page_mut(target)?;
            target_guard
                .write()
                .insert_cell(&Cell::new_interior(separator, moved_child))?;
            self.sync_fsm_class(target, &target_guard.read())?;
            {
                let child_guard = self.buffer_pool.fetch_page_mut(moved_child)?;
                child_guard.write().set_parent(target);
            }
            self.sync_fsm_class(right, &self.buffer_pool.fetch_page(right)?.read())?;
            self.set_parent_separator(parent, pos, &new_separator)?;
        }
        log::trace!("btree: redistributed from right sibling {right} into {target}");
        Ok(true)
    }

    fn try_redistribute_left(&self, target: PageIndex, left: PageIndex, parent: PageIndex, pos: usize) -> Result<bool> {
        let is_leaf = self.buffer_pool.fetch_page(target)?.read().is_leaf();
        let donor_has_spare = {
            let guard = self.buffer_pool.fetch_page(left)?;
            node::has_spare_capacity(&guard.read(), self.page_size)
        };
        if !donor_has_spare {
            return Ok(false);
        }

        if is_leaf {
            let cell = {
                let left_guard = self.buffer_pool.fetch_page_mut(left)?;
                let mut left_page = left_guard.write();
                let last = left_page.cell_count() - 1;
                left_page.delete_cell(last)?
            };
            let new_separator = cell.key().to_vec();
            let target_guard = self.buffer_pool.fetch_page_mut(target)?;
            target_guard.write().insert_cell(&cell)?;
            self.sync_fsm_class(target, &target_guard.read())?;
            self.sync_fsm_class(left, &self.buffer_pool.fetch_page(left)?.read())?;
            self.set_parent_separator(parent, pos - 1, &new_separator)?;
        } else {
            let separator = {
                let guard = self.buffer_pool.fetch_page(parent)?;
                guard.read().get_cell(pos - 1)?.key().to_vec()
            };
            let (moved_child, new_separator) = {
                let left_guard = self.buffer_pool.fetch_page_mut(left)?;
                let mut left_page = left_guard.write();
                let last = left_page.cell_count() - 1;
                let last_cell = left_page.delete_cell(last)?;
                match last_cell {
                    Cell::Interior { key, child } => (child, key),
                    Cell::Leaf { .. } => unreachable!(),
                }
            };
            let target_guard = self.buffer_pool.fetch_page_mut(target)?;
            let old_first_child = {
                let mut target_page = target_guard.write();
                let old_first_child = target_page.first_child();
                target_page.set_first_child(moved_child);
                target_page.insert_cell(&Cell::new_interior(separator, old_first_child))?;
                old_first_child
            };
            self.sync_fsm_class(target, &target_guard.read())?;
            let _ = old_first_child;
            {
                let child_guard = self.buffer_pool.fetch_page_mut(moved_child)?;
                child_guard.write().set_parent(target);
            }
            self.sync_fsm_class(left, &self.buffer_pool.fetch_page(left)?.read())?;
            self.set_parent_separator(parent, pos - 1, &new_separator)?;
        }
        log::trace!("btree: redistributed from left sibling {left} into {target}");
        Ok(true)
    }

    fn set_parent_separator(&self, parent: PageIndex, sep_index: usize, new_key: &[u8]) -> Result<()> {
        let guard = self.buffer_pool.fetch_page_mut(parent)?;
        let child = match guard.read().get_cell(sep_index)? {
            Cell::Interior { child, .. } => child,
            Cell::Leaf { .. } => unreachable!(),
        };
        let mut page = guard.write();
        page.delete_cell(sep_index)?;
        page.insert_cell(&Cell::new_interior(new_key.to_vec(), child))?;
        Ok(())
    }

    /// Merge `right`'s contents into `left` and delete the separator
    /// between them from `parent` (spec.md §4.5). Returns after `parent`
    /// has lost one child — the caller continues underflow checks there.
    fn merge_nodes(&mut self, left: PageIndex, right: PageIndex, parent: PageIndex, sep_index: usize) -> Result<()> {
        log::debug!("btree: merging page {right} into {left} under parent {parent}");
        let separator = {
            let guard = self.buffer_pool.fetch_page(parent)?;
            guard.read().get_cell(sep_index)?.key().to_vec()
        };
        let right_page = {
            let guard = self.buffer_pool.fetch_page(right)?;
            guard.read().clone()
        };
        let right_next = right_page.header().next_page_index;

        {
            let left_guard = self.buffer_pool.fetch_page_mut(left)?;
            let mut left_page = left_guard.write();
            left_page.merge_from(&right_page, Some(&separator))?;
            left_page.set_next(right_next);
        }
        self.reparent_children(left, &right_page)?;
        self.sync_fsm_class(left, &self.buffer_pool.fetch_page(left)?.read())?;

        if right_next.is_valid() {
            let guard = self.buffer_pool.fetch_page_mut(right_next)?;
            guard.write().set_previous(left);
        }
        self.free_node_page(right)?;

        let parent_guard = self.buffer_pool.fetch_page_mut(parent)?;
        parent_guard.write().delete_cell(sep_index)?;
        self.sync_fsm_class(parent, &parent_guard.read())?;
        Ok(())
    }

    fn collapse_root_if_needed(&mut self, index: PageIndex) -> Result<()> {
        let (is_leaf, cell_count, first_child) = {
            let guard = self.buffer_pool.fetch_page(index)?;
            let page = guard.read();
            (page.is_leaf(), page.cell_count(), page.first_child())
        };
        if is_leaf {
            if cell_count == 0 {
                self.free_node_page(index)?;
                self.root = PageIndex::INVALID;
            }
            return Ok(());
        }
        if cell_count == 0 {
            {
                let guard = self.buffer_pool.fetch_page_mut(first_child)?;
                guard.write().set_parent(PageIndex::INVALID);
            }
            self.free_node_page(index)?;
            self.root = first_child;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_store::FilePageStore;
    use crate::storage::{fsm as fsm_mod};
    use crate::page::FreeSpaceMapPageHeader;
    use tempfile::tempdir;

    fn new_tree(capacity: usize) -> (tempfile::TempDir, BPlusTree) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn PageStore> =
            Arc::new(FilePageStore::create_new(&dir.path().join("tree.db"), 4096, false).unwrap());
        store.create_page().unwrap(); // heading
        let fsm_root = store.create_page().unwrap();
        let header = FreeSpaceMapPageHeader::new(fsm_root, PageIndex::new(0));
        let mut buf = vec![0u8; 4096];
        header.write(&mut buf);
        store.update_page(fsm_root, &buf).unwrap();
        let _ = fsm_mod::get_class(store.as_ref(), fsm_root, PageIndex::new(0));

        let pool = Arc::new(BufferPoolImpl::new(Arc::clone(&store), capacity));
        let tree = BPlusTree::new(store, pool, fsm_root, PageIndex::INVALID);
        (dir, tree)
    }

    #[test]
    fn empty_tree_has_no_entries() {
        let (_dir, tree) = new_tree(100);
        assert_eq!(tree.get(b"a").unwrap(), None);
        assert_eq!(tree.min_key().unwrap(), None);
        assert_eq!(tree.count().unwrap(), 0);
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, mut tree) = new_tree(100);
        tree.put(b"hello", b"world").unwrap();
        assert_eq!(tree.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(tree.get(b"missing").unwrap(), None);
    }

    #[test]
    fn update_existing_key() {
        let (_dir, mut tree) = new_tree(100);
        tree.put(b"key", b"v1").unwrap();
        tree.put(b"key", b"v2").unwrap();
        assert_eq!(tree.get(b"key").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(tree.count().unwrap(), 1);
    }

    #[test]
    fn many_inserts_trigger_splits_and_stay_sorted() {
        let (_dir, mut tree) = new_tree(20);
        for i in 0..500 {
            let key = format!("key{:04}", i);
            let value = format!("value{}", i);
            tree.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
        for i in 0..500 {
            let key = format!("key{:04}", i);
            let expected = format!("value{}", i);
            assert_eq!(tree.get(key.as_bytes()).unwrap(), Some(expected.into_bytes()));
        }
        assert_eq!(tree.min_key().unwrap(), Some(b"key0000".to_vec()));
        assert_eq!(tree.max_key().unwrap(), Some(b"key0499".to_vec()));
        assert_eq!(tree.count().unwrap(), 500);

        let all = tree.scan(None, None).unwrap();
        assert_eq!(all.len(), 500);
        for pair in all.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn delete_removes_key_and_shrinks_tree() {
        let (_dir, mut tree) = new_tree(20);
        for i in 0..200 {
            let key = format!("k{:04}", i);
            tree.put(key.as_bytes(), b"v").unwrap();
        }
        for i in 0..150 {
            let key = format!("k{:04}", i);
            assert!(tree.remove(key.as_bytes()).unwrap());
        }
        for i in 0..150 {
            let key = format!("k{:04}", i);
            assert_eq!(tree.get(key.as_bytes()).unwrap(), None);
        }
        for i in 150..200 {
            let key = format!("k{:04}", i);
            assert!(tree.get(key.as_bytes()).unwrap().is_some());
        }
        assert_eq!(tree.count().unwrap(), 50);
    }

    #[test]
    fn delete_last_key_empties_tree() {
        let (_dir, mut tree) = new_tree(20);
        tree.put(b"only", b"value").unwrap();
        assert!(tree.remove(b"only").unwrap());
        assert_eq!(tree.get(b"only").unwrap(), None);
        assert_eq!(tree.root(), PageIndex::INVALID);
    }

    #[test]
    fn remove_missing_key_is_noop() {
        let (_dir, mut tree) = new_tree(20);
        tree.put(b"a", b"1").unwrap();
        assert!(!tree.remove(b"missing").unwrap());
        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn next_and_previous_key() {
        let (_dir, mut tree) = new_tree(100);
        for key in [b"b", b"d", b"f"] {
            tree.put(key, b"v").unwrap();
        }
        assert_eq!(tree.next_key(b"a").unwrap(), Some(b"b".to_vec()));
        assert_eq!(tree.next_key(b"b").unwrap(), Some(b"d".to_vec()));
        assert_eq!(tree.next_key(b"f").unwrap(), None);
        assert_eq!(tree.previous_key(b"f").unwrap(), Some(b"d".to_vec()));
        assert_eq!(tree.previous_key(b"d").unwrap(), Some(b"b".to_vec()));
        assert_eq!(tree.previous_key(b"b").unwrap(), None);
        assert_eq!(tree.previous_key(b"z").unwrap(), Some(b"f".to_vec()));
    }

    #[test]
    fn next_and_previous_key_cross_leaf_boundaries() {
        // Values big enough that only one entry fits per leaf, so every
        // adjacent pair of keys straddles a leaf boundary.
        let (_dir, mut tree) = new_tree(200);
        let value = vec![0u8; 2040];
        let mut keys = Vec::new();
        for i in 0..40u32 {
            let key = format!("k{:04}", i);
            tree.put(key.as_bytes(), &value).unwrap();
            keys.push(key);
        }
        let (tree_pages, _, _) = tree.page_stats().unwrap();
        assert!(tree_pages > 1, "test setup must force multiple leaves");

        // A probe key that sorts after every entry of a non-last leaf, but
        // before the following leaf's first entry, must resolve across the
        // leaf boundary rather than falling back to None (next_key) or the
        // tree's global maximum (previous_key).
        for pair in keys.windows(2) {
            let probe = format!("{}x", pair[0]);
            assert_eq!(tree.next_key(probe.as_bytes()).unwrap(), Some(pair[1].clone().into_bytes()));
            assert_eq!(tree.previous_key(probe.as_bytes()).unwrap(), Some(pair[0].clone().into_bytes()));
        }
    }

    #[test]
    fn range_scan_respects_bounds() {
        let (_dir, mut tree) = new_tree(100);
        for c in b'a'..=b'j' {
            tree.put(&[c], b"v").unwrap();
        }
        let range = tree.scan(Some(b"c"), Some(b"g")).unwrap();
        let keys: Vec<u8> = range.iter().map(|(k, _)| k[0]).collect();
        assert_eq!(keys, vec![b'c', b'd', b'e', b'f']);
    }

    #[test]
    fn blob_values_round_trip_exactly() {
        let (_dir, mut tree) = new_tree(20);
        let value = vec![0x7Au8; 4096 * 3 + 17];
        tree.put(b"big", &value).unwrap();
        assert_eq!(tree.get(b"big").unwrap(), Some(value));
    }

    #[test]
    fn page_stats_counts_nodes_and_blob_fragments() {
        let (_dir, mut tree) = new_tree(20);
        assert_eq!(tree.page_stats().unwrap(), (0, 0, 0));

        for i in 0..200 {
            let key = format!("k{:04}", i);
            tree.put(key.as_bytes(), b"v").unwrap();
        }
        let (tree_pages, blob_pages, entries) = tree.page_stats().unwrap();
        assert!(tree_pages > 1);
        assert_eq!(blob_pages, 0);
        assert_eq!(entries, 200);

        let value = vec![0x11u8; 4096 * 2];
        tree.put(b"big", &value).unwrap();
        let (_, blob_pages, entries) = tree.page_stats().unwrap();
        assert!(blob_pages >= 2);
        assert_eq!(entries, 201);
    }
}
