//! Node-level occupancy rules shared by insert and delete maintenance
//! (spec.md §4.5: "a node underflows when its free bytes exceed half of
//! `P` minus the node header").

use crate::page::header::BTREE_NODE_HEADER_SIZE;
use crate::page::SlottedPage;

/// Usable body bytes of a node page: total page size minus the fixed
/// B+Tree node header.
pub fn usable_space(page_size: u32) -> usize {
    page_size as usize - BTREE_NODE_HEADER_SIZE
}

/// Whether `page` has fallen below minimum occupancy and needs
/// redistribution or merging with a sibling.
pub fn is_underflow(page: &SlottedPage, page_size: u32) -> bool {
    page.free_space() * 2 > usable_space(page_size)
}

/// Whether `sibling` has enough occupancy to donate one entry to a
/// neighbor without itself underflowing.
pub fn has_spare_capacity(sibling: &SlottedPage, page_size: u32) -> bool {
    sibling.cell_count() > 1 && !is_underflow(sibling, page_size)
}
