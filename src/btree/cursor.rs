//! Streaming cursor over B+Tree entries (spec.md §4.5 "Range scan").
//!
//! Unlike [`crate::btree::BPlusTree::scan`], which eagerly materializes a
//! `Vec`, a `Cursor` holds only its current leaf and cell index and walks
//! `NextPageIndex` one entry at a time — the same sibling-chain technique,
//! exposed as an incremental walk for callers that don't want an entire
//! range in memory at once.

use crate::buffer::{BufferPool, BufferPoolImpl};
use crate::error::Result;
use crate::page::{Cell, ValueRef};
use crate::storage::blob;
use crate::storage::page_store::PageStore;
use crate::types::PageIndex;
use std::sync::Arc;

/// A forward cursor over a contiguous run of leaf entries.
pub struct Cursor {
    store: Arc<dyn PageStore>,
    buffer_pool: Arc<BufferPoolImpl>,
    leaf: PageIndex,
    idx: usize,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    done: bool,
}

impl Cursor {
    /// Construct a cursor that starts at `leaf`'s first cell and skips
    /// forward past any key less than `start`, the same filter
    /// [`super::tree::BPlusTree::scan`] applies inline, stopping before the
    /// first key greater than or equal to `end` if given.
    pub(crate) fn new(
        store: Arc<dyn PageStore>,
        buffer_pool: Arc<BufferPoolImpl>,
        leaf: PageIndex,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    ) -> Self {
        let done = !leaf.is_valid();
        Self {
            store,
            buffer_pool,
            leaf,
            idx: 0,
            start,
            end,
            done,
        }
    }

    /// Advance and return the next `(key, value)` pair, or `None` once the
    /// cursor has passed `end` or run off the end of the leaf chain.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let guard = self.buffer_pool.fetch_page(self.leaf)?;
            let page = guard.read();

            if self.idx >= page.cell_count() {
                let next = page.header().next_page_index;
                drop(page);
                drop(guard);
                if !next.is_valid() {
                    self.done = true;
                    return Ok(None);
                }
                self.leaf = next;
                self.idx = 0;
                continue;
            }

            let cell = page.get_cell(self.idx)?;
            if let Some(start) = &self.start {
                if cell.key() < start.as_slice() {
                    self.idx += 1;
                    continue;
                }
            }
            if let Some(end) = &self.end {
                if cell.key() >= end.as_slice() {
                    self.done = true;
                    return Ok(None);
                }
            }

            let key = cell.key().to_vec();
            let value = match cell {
                Cell::Leaf { value, .. } => match value {
                    ValueRef::Inline(bytes) => bytes,
                    ValueRef::Blob {
                        start_page_index,
                        size_class,
                        value_len,
                    } => {
                        let mut bytes = blob::read_blob(self.store.as_ref(), start_page_index, size_class)?;
                        bytes.truncate(value_len as usize);
                        bytes
                    }
                },
                Cell::Interior { .. } => unreachable!("leaf page holds only leaf cells"),
            };
            self.idx += 1;
            return Ok(Some((key, value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_store::FilePageStore;
    use crate::storage::fsm;
    use crate::btree::BPlusTree;
    use crate::page::FreeSpaceMapPageHeader;
    use tempfile::tempdir;

    fn new_tree() -> (tempfile::TempDir, BPlusTree) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn PageStore> =
            Arc::new(FilePageStore::create_new(&dir.path().join("cursor.db"), 4096, false).unwrap());
        store.create_page().unwrap();
        let fsm_root = store.create_page().unwrap();
        let header = FreeSpaceMapPageHeader::new(fsm_root, PageIndex::new(0));
        let mut buf = vec![0u8; 4096];
        header.write(&mut buf);
        store.update_page(fsm_root, &buf).unwrap();
        let _ = fsm::get_class(store.as_ref(), fsm_root, PageIndex::new(0));

        let pool = Arc::new(BufferPoolImpl::new(Arc::clone(&store), 50));
        let tree = BPlusTree::new(store, pool, fsm_root, PageIndex::INVALID);
        (dir, tree)
    }

    #[test]
    fn cursor_over_empty_tree_yields_nothing() {
        let (_dir, tree) = new_tree();
        let mut cursor = tree.cursor(None, None).unwrap();
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn cursor_walks_entries_in_order() {
        let (_dir, mut tree) = new_tree();
        for c in b'a'..=b'e' {
            tree.put(&[c], b"v").unwrap();
        }
        let mut cursor = tree.cursor(None, None).unwrap();
        let mut seen = Vec::new();
        while let Some((k, _)) = cursor.next().unwrap() {
            seen.push(k[0]);
        }
        assert_eq!(seen, vec![b'a', b'b', b'c', b'd', b'e']);
    }

    #[test]
    fn cursor_respects_bounds_across_leaf_boundaries() {
        let (_dir, mut tree) = new_tree();
        for i in 0..200u32 {
            let key = format!("k{:04}", i);
            tree.put(key.as_bytes(), b"v").unwrap();
        }
        let mut cursor = tree.cursor(Some(b"k0050"), Some(b"k0053")).unwrap();
        let mut seen = Vec::new();
        while let Some((k, _)) = cursor.next().unwrap() {
            seen.push(String::from_utf8(k).unwrap());
        }
        assert_eq!(seen, vec!["k0050", "k0051", "k0052"]);
    }
}
