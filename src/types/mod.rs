//! Common types used throughout the storage engine.

mod page_index;
mod size_class;
mod varint;

pub use page_index::PageIndex;
pub use size_class::{FsmClass, SizeClass};
pub use varint::{decode_varint, encode_varint, varint_size};

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Default page size in bytes, used when a caller does not pick one
/// explicitly at creation time.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Minimum allowed page size (spec.md §3: "must be a power of two and >=
/// 4096").
pub const MIN_PAGE_SIZE: u32 = 4096;

/// The on-disk structure version this crate reads and writes. Pinned
/// alongside the size-class boundary table (SPEC_FULL.md §11): both are a
/// function of the structure version, and this crate implements exactly
/// one version.
pub const STRUCTURE_VERSION: u32 = 1;

/// Validate that a requested page size is a power of two and at least
/// [`MIN_PAGE_SIZE`].
pub fn validate_page_size(page_size: u32) -> Result<()> {
    if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
        return Err(StorageError::invalid_operation(format!(
            "page size {} must be a power of two >= {}",
            page_size, MIN_PAGE_SIZE
        )));
    }
    Ok(())
}

/// Maximum key size, chosen so that at least two entries always fit in an
/// otherwise-empty leaf of a given page size.
pub fn max_key_size(page_size: u32) -> usize {
    page_size as usize / 4
}

/// Maximum size a value may have before the blob allocator must store it
/// out-of-line across a multi-page chain (spec.md §1: "Values may be
/// arbitrarily large and are stored out-of-line when they exceed a page").
pub fn max_inline_value_size(page_size: u32) -> usize {
    page_size as usize / 2
}

/// The page types recorded in every page's common header (spec.md §3).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Heading = 0,
    FreeSpaceMap = 1,
    BPlusTreeNode = 2,
    RadixTreeNode = 3,
    FixedSizeItem = 4,
    VariableSizeItem = 5,
    MultiPage = 6,
    Free = 7,
}

impl PageType {
    /// Decode a page type from its on-disk byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Heading),
            1 => Some(Self::FreeSpaceMap),
            2 => Some(Self::BPlusTreeNode),
            3 => Some(Self::RadixTreeNode),
            4 => Some(Self::FixedSizeItem),
            5 => Some(Self::VariableSizeItem),
            6 => Some(Self::MultiPage),
            7 => Some(Self::Free),
            _ => None,
        }
    }
}

/// Which access method a storage uses over its paged file (spec.md §3
/// `HeadingPageHeader.AccessMethod`). Only [`AccessMethodKind::BPlusTree`]
/// is implemented by this crate; the Radix Tree variant is out of scope
/// (spec.md §1) and opening a storage tagged with it fails with
/// `NotSupportedError`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMethodKind {
    BPlusTree = 0,
    RadixTree = 1,
}

impl AccessMethodKind {
    /// Decode an access method tag from its on-disk byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::BPlusTree),
            1 => Some(Self::RadixTree),
            _ => None,
        }
    }
}

/// Settings a storage is created with. Only meaningful at `create_new`
/// time; `open_existing` reads the equivalent fields back from the heading
/// page and validates them against whatever settings the caller supplies
/// (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSettings {
    /// Page size in bytes. Must be a power of two, >= 4096.
    pub page_size: u32,
    /// Buffer pool capacity, in number of cached pages.
    pub buffer_pool_size: usize,
    /// Whether to `fsync` after every page write.
    pub sync_on_write: bool,
    /// Access method the storage uses.
    pub access_method: AccessMethodKind,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_size: 1000,
            sync_on_write: false,
            access_method: AccessMethodKind::BPlusTree,
        }
    }
}

impl StorageSettings {
    /// Settings for a storage at `page_size` bytes per page, with other
    /// fields left at their defaults.
    pub fn with_page_size(page_size: u32) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            page_size,
            ..Self::default()
        })
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = size;
        self
    }

    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_validation() {
        assert!(validate_page_size(4096).is_ok());
        assert!(validate_page_size(65536).is_ok());
        assert!(validate_page_size(2048).is_err());
        assert!(validate_page_size(5000).is_err());
    }

    #[test]
    fn page_type_roundtrip() {
        assert_eq!(PageType::from_byte(2), Some(PageType::BPlusTreeNode));
        assert_eq!(PageType::from_byte(255), None);
    }

    #[test]
    fn access_method_roundtrip() {
        assert_eq!(
            AccessMethodKind::from_byte(0),
            Some(AccessMethodKind::BPlusTree)
        );
        assert_eq!(AccessMethodKind::from_byte(9), None);
    }
}
