//! Blob allocator (spec.md §4.3).
//!
//! Values that exceed [`crate::types::max_inline_value_size`] are stored
//! out-of-line: either in a single oversized page (still addressed through
//! the same size-class machinery) or split across a chain of `MultiPage`
//! fragments linked by `next_page_index`. A value is addressed by the
//! `(start_page_index, size_class)` pair a leaf cell's [`crate::page::ValueRef::Blob`]
//! carries.

use crate::error::Result;
use crate::page::header::MULTI_PAGE_HEADER_SIZE;
use crate::page::MultiPageHeader;
use crate::storage::fsm;
use crate::storage::page_store::PageStore;
use crate::types::{FsmClass, PageIndex, SizeClass};

fn fragment_capacity(page_size: u32) -> usize {
    page_size as usize - MULTI_PAGE_HEADER_SIZE
}

/// Write `value` out-of-line, returning the blob's start page and size
/// class (stored inline in the leaf cell).
pub fn write_blob(store: &dyn PageStore, fsm_root: PageIndex, value: &[u8]) -> Result<(PageIndex, SizeClass)> {
    let page_size = store.page_size();
    let capacity = fragment_capacity(page_size);
    let size_class = SizeClass::MultiPage;

    let chunks: Vec<&[u8]> = if value.is_empty() {
        vec![&value[0..0]]
    } else {
        value.chunks(capacity).collect()
    };

    // Reserve and stamp one fragment at a time: `find_page` always returns
    // the lowest `NotUsed` page, so reserving all indices before stamping
    // any of them would hand out the same released page to every fragment.
    let mut fragment_indices = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        let index = fsm::find_page(store, fsm_root, FsmClass::NotUsed)?
            .map(Ok)
            .unwrap_or_else(|| store.create_page())?;
        fsm::set_class(store, fsm_root, index, FsmClass::Full)?;
        fragment_indices.push(index);
    }

    log::debug!("blob: writing {} byte(s) across {} fragment(s)", value.len(), chunks.len());
    let start = fragment_indices[0];
    for (i, chunk) in chunks.iter().enumerate() {
        let mut header = MultiPageHeader::new(start, size_class);
        header.previous_page_index = if i == 0 {
            PageIndex::INVALID
        } else {
            fragment_indices[i - 1]
        };
        header.next_page_index = if i + 1 < fragment_indices.len() {
            fragment_indices[i + 1]
        } else {
            PageIndex::INVALID
        };

        let mut buf = vec![0u8; page_size as usize];
        header.write(&mut buf);
        buf[MULTI_PAGE_HEADER_SIZE..MULTI_PAGE_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        store.update_page(fragment_indices[i], &buf)?;
    }

    Ok((start, size_class))
}

/// Read a previously-written blob back into a single `Vec<u8>`.
pub fn read_blob(store: &dyn PageStore, start: PageIndex, expected_class: SizeClass) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut current = start;
    let mut first = true;
    loop {
        let buf = store.fetch_page(current)?;
        let header = MultiPageHeader::read(&buf)?;
        if first && header.size_range != expected_class {
            return Err(crate::error::StorageError::storage_format(
                "blob fragment size class does not match its reference",
            ));
        }
        first = false;
        out.extend_from_slice(&buf[MULTI_PAGE_HEADER_SIZE..]);
        if header.next_page_index.is_valid() {
            current = header.next_page_index;
        } else {
            break;
        }
    }
    // The final fragment is zero-padded to a full page; the caller trims
    // to the value's true length, which it carries separately (the leaf
    // cell's `ValueRef::Blob::value_len`).
    Ok(out)
}

/// Count the fragments in a blob chain, for `Storage::stats()` page
/// accounting (spec.md §8 property 5).
pub fn count_fragments(store: &dyn PageStore, start: PageIndex) -> Result<u64> {
    let mut current = start;
    let mut count = 0u64;
    loop {
        let buf = store.fetch_page(current)?;
        let header = MultiPageHeader::read(&buf)?;
        count += 1;
        if header.next_page_index.is_valid() {
            current = header.next_page_index;
        } else {
            return Ok(count);
        }
    }
}

/// Release every fragment of a blob chain back to the free-space map.
pub fn release_blob(store: &dyn PageStore, fsm_root: PageIndex, start: PageIndex) -> Result<()> {
    log::debug!("blob: releasing chain starting at page {start}");
    let mut current = start;
    loop {
        let buf = store.fetch_page(current)?;
        let header = MultiPageHeader::read(&buf)?;
        fsm::release(store, fsm_root, current)?;
        if header.next_page_index.is_valid() {
            current = header.next_page_index;
        } else {
            break;
        }
    }
    Ok(())
}
