//! Free-space map (spec.md §3, §4.2).
//!
//! Every data page's fullness is tracked as a 4-bit [`FsmClass`] packed two
//! to a byte, across a chain of FSM pages linked by `next_page_index`. Each
//! FSM page's `base_page_index` is the first data page index it describes;
//! pages are created lazily as the data file grows past what the current
//! chain covers.

use crate::error::{Result, StorageError};
use crate::page::header::FSM_HEADER_SIZE;
use crate::page::FreeSpaceMapPageHeader;
use crate::storage::page_store::PageStore;
use crate::types::{FsmClass, PageIndex};

fn entries_per_page(page_size: u32) -> i64 {
    (page_size as i64 - FSM_HEADER_SIZE as i64) * 2
}

fn read_nibble(byte: u8, slot_is_odd: bool) -> u8 {
    if slot_is_odd {
        byte >> 4
    } else {
        byte & 0x0F
    }
}

fn write_nibble(byte: u8, slot_is_odd: bool, value: u8) -> u8 {
    if slot_is_odd {
        (byte & 0x0F) | (value << 4)
    } else {
        (byte & 0xF0) | (value & 0x0F)
    }
}

struct Located {
    fsm_page_index: PageIndex,
    header: FreeSpaceMapPageHeader,
    byte_offset: usize,
    slot_is_odd: bool,
}

/// Walk the FSM chain from `fsm_root` looking for the page covering
/// `target`. Creates new chained pages as needed when `allow_create` is set
/// and the chain doesn't yet reach far enough; otherwise returns `Ok(None)`.
fn locate(
    store: &dyn PageStore,
    fsm_root: PageIndex,
    target: PageIndex,
    allow_create: bool,
) -> Result<Option<Located>> {
    let page_size = store.page_size();
    let per_page = entries_per_page(page_size);

    let mut current_index = fsm_root;
    loop {
        let buf = store.fetch_page(current_index)?;
        let header = FreeSpaceMapPageHeader::read(&buf)?;

        let base = header.base_page_index.value();
        let slot = target.value() - base;
        if (0..per_page).contains(&slot) {
            let byte_offset = FSM_HEADER_SIZE + (slot / 2) as usize;
            return Ok(Some(Located {
                fsm_page_index: current_index,
                header,
                byte_offset,
                slot_is_odd: slot % 2 == 1,
            }));
        }

        if header.next_page_index.is_valid() {
            current_index = header.next_page_index;
            continue;
        }

        if !allow_create {
            return Ok(None);
        }

        let new_base = PageIndex::new(base + per_page);
        let new_fsm_index = store.create_page()?;
        log::debug!("fsm: extending chain with page {new_fsm_index}, base {new_base}");
        let mut new_header = FreeSpaceMapPageHeader::new(new_fsm_index, new_base);
        new_header.previous_page_index = current_index;
        let mut new_buf = vec![0u8; page_size as usize];
        new_header.write(&mut new_buf);
        store.update_page(new_fsm_index, &new_buf)?;

        let mut linking_buf = buf;
        let mut linked_header = header;
        linked_header.next_page_index = new_fsm_index;
        linked_header.write(&mut linking_buf);
        store.update_page(current_index, &linking_buf)?;

        current_index = new_fsm_index;
    }
}

/// Read a page's current class. Pages beyond the chain's current reach are
/// reported as [`FsmClass::NotUsed`] without allocating new FSM pages.
pub fn get_class(store: &dyn PageStore, fsm_root: PageIndex, target: PageIndex) -> Result<FsmClass> {
    match locate(store, fsm_root, target, false)? {
        None => Ok(FsmClass::NotUsed),
        Some(found) => {
            let buf = store.fetch_page(found.fsm_page_index)?;
            let nibble = read_nibble(buf[found.byte_offset], found.slot_is_odd);
            FsmClass::from_nibble(nibble)
                .ok_or_else(|| StorageError::storage_format("invalid FSM nibble"))
        }
    }
}

/// Record `target`'s current class, extending the FSM chain if needed.
pub fn set_class(store: &dyn PageStore, fsm_root: PageIndex, target: PageIndex, class: FsmClass) -> Result<()> {
    let found = locate(store, fsm_root, target, true)?.expect("locate with allow_create always succeeds");
    let mut buf = store.fetch_page(found.fsm_page_index)?;
    buf[found.byte_offset] = write_nibble(buf[found.byte_offset], found.slot_is_odd, class.as_nibble());
    store.update_page(found.fsm_page_index, &buf)
}

/// Mark `target` as not in use (spec.md §4.2 `release`).
pub fn release(store: &dyn PageStore, fsm_root: PageIndex, target: PageIndex) -> Result<()> {
    set_class(store, fsm_root, target, FsmClass::NotUsed)
}

/// Find a page whose recorded class satisfies `min_class`, scanning the
/// existing FSM chain in page order (spec.md §4.2 `find_page`).
pub fn find_page(store: &dyn PageStore, fsm_root: PageIndex, min_class: FsmClass) -> Result<Option<PageIndex>> {
    let mut current_index = fsm_root;
    loop {
        let buf = store.fetch_page(current_index)?;
        let header = FreeSpaceMapPageHeader::read(&buf)?;
        let per_page = entries_per_page(store.page_size());

        for slot in 0..per_page {
            let byte_offset = FSM_HEADER_SIZE + (slot / 2) as usize;
            let nibble = read_nibble(buf[byte_offset], slot % 2 == 1);
            let Some(class) = FsmClass::from_nibble(nibble) else {
                continue;
            };
            if class.satisfies(min_class) {
                let candidate = PageIndex::new(header.base_page_index.value() + slot);
                if (candidate.value() as u64) < (store.page_count()? as u64) {
                    return Ok(Some(candidate));
                }
            }
        }

        if !header.next_page_index.is_valid() {
            return Ok(None);
        }
        current_index = header.next_page_index;
    }
}

/// Count the pages making up the FSM chain, for `Storage::stats()` page
/// accounting (spec.md §8 property 5).
pub fn page_count(store: &dyn PageStore, fsm_root: PageIndex) -> Result<u64> {
    let mut current = fsm_root;
    let mut count = 0u64;
    loop {
        let buf = store.fetch_page(current)?;
        let header = FreeSpaceMapPageHeader::read(&buf)?;
        count += 1;
        if header.next_page_index.is_valid() {
            current = header.next_page_index;
        } else {
            return Ok(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_store::FilePageStore;
    use tempfile::tempdir;

    fn new_store_with_fsm_root() -> (tempfile::TempDir, FilePageStore, PageIndex) {
        let dir = tempdir().unwrap();
        let store = FilePageStore::create_new(&dir.path().join("fsm.db"), 4096, false).unwrap();
        store.create_page().unwrap(); // heading page (0)
        let fsm_root = store.create_page().unwrap(); // page 1
        let mut header = FreeSpaceMapPageHeader::new(fsm_root, PageIndex::new(0));
        header.base_page_index = PageIndex::new(0);
        let mut buf = vec![0u8; 4096];
        header.write(&mut buf);
        store.update_page(fsm_root, &buf).unwrap();
        (dir, store, fsm_root)
    }

    #[test]
    fn unset_pages_report_not_used() {
        let (_dir, store, fsm_root) = new_store_with_fsm_root();
        let class = get_class(&store, fsm_root, PageIndex::new(2)).unwrap();
        assert_eq!(class, FsmClass::NotUsed);
    }

    #[test]
    fn set_and_get_roundtrip() {
        let (_dir, store, fsm_root) = new_store_with_fsm_root();
        set_class(&store, fsm_root, PageIndex::new(5), FsmClass::Class4).unwrap();
        assert_eq!(get_class(&store, fsm_root, PageIndex::new(5)).unwrap(), FsmClass::Class4);
        assert_eq!(get_class(&store, fsm_root, PageIndex::new(6)).unwrap(), FsmClass::NotUsed);
    }

    #[test]
    fn find_page_respects_min_class() {
        let (_dir, store, fsm_root) = new_store_with_fsm_root();
        for _ in 0..10 {
            store.create_page().unwrap();
        }
        set_class(&store, fsm_root, PageIndex::new(3), FsmClass::Class2).unwrap();
        set_class(&store, fsm_root, PageIndex::new(7), FsmClass::Class6).unwrap();

        let found = find_page(&store, fsm_root, FsmClass::Class5).unwrap();
        assert_eq!(found, Some(PageIndex::new(7)));

        let found_low = find_page(&store, fsm_root, FsmClass::Class1).unwrap();
        assert_eq!(found_low, Some(PageIndex::new(3)));
    }

    #[test]
    fn release_resets_to_not_used() {
        let (_dir, store, fsm_root) = new_store_with_fsm_root();
        set_class(&store, fsm_root, PageIndex::new(2), FsmClass::Class7).unwrap();
        release(&store, fsm_root, PageIndex::new(2)).unwrap();
        assert_eq!(get_class(&store, fsm_root, PageIndex::new(2)).unwrap(), FsmClass::NotUsed);
    }

    #[test]
    fn chain_extends_lazily_past_first_page() {
        let (_dir, store, fsm_root) = new_store_with_fsm_root();
        let per_page = entries_per_page(4096);
        let far_target = PageIndex::new(per_page + 3);
        set_class(&store, fsm_root, far_target, FsmClass::Class3).unwrap();
        assert_eq!(get_class(&store, fsm_root, far_target).unwrap(), FsmClass::Class3);
    }

    #[test]
    fn page_count_tracks_chain_growth() {
        let (_dir, store, fsm_root) = new_store_with_fsm_root();
        assert_eq!(page_count(&store, fsm_root).unwrap(), 1);
        let per_page = entries_per_page(4096);
        set_class(&store, fsm_root, PageIndex::new(per_page + 3), FsmClass::Class3).unwrap();
        assert_eq!(page_count(&store, fsm_root).unwrap(), 2);
    }
}
