//! Page header structures.
//!
//! Every page begins with the common header (spec.md §6); specialized
//! headers extend it at fixed offsets. All integers are little-endian.

use crate::error::{Result, StorageError};
use crate::types::{AccessMethodKind, PageIndex, PageType, SizeClass};

/// Size of the common header shared by every page (spec.md §6).
pub const COMMON_HEADER_SIZE: usize = 4;

/// Size of a [`HeadingPageHeader`] (padded to a round number).
pub const HEADING_HEADER_SIZE: usize = 32;

/// Size of a [`FreeSpaceMapPageHeader`] (padded to a round number).
pub const FSM_HEADER_SIZE: usize = 40;

/// Size of a [`BPlusTreeNodePageHeader`] — pinned at 30 bytes by spec.md §6
/// ("B+Tree node header is 30 bytes: common + ParentPageIndex[8] +
/// PreviousPageIndex[8] + NextPageIndex[8] + IsLeaf[1], padded").
pub const BTREE_NODE_HEADER_SIZE: usize = 30;

/// Size of a [`MultiPageHeader`] (padded to a round number).
pub const MULTI_PAGE_HEADER_SIZE: usize = 32;

/// Fields shared by every page (spec.md §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub page_type: PageType,
    pub size_class: SizeClass,
    /// Header size in bytes (lets a reader skip past a header it doesn't
    /// recognize without knowing its concrete layout).
    pub length: u16,
}

impl CommonHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return Err(StorageError::storage_format("page shorter than common header"));
        }
        let page_type = PageType::from_byte(bytes[0])
            .ok_or_else(|| StorageError::storage_format(format!("unknown page type {}", bytes[0])))?;
        let size_class = SizeClass::from_byte(bytes[1])
            .ok_or_else(|| StorageError::storage_format(format!("unknown size class {}", bytes[1])))?;
        let length = u16::from_le_bytes([bytes[2], bytes[3]]);
        Ok(Self {
            page_type,
            size_class,
            length,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0] = self.page_type as u8;
        bytes[1] = self.size_class as u8;
        bytes[2..4].copy_from_slice(&self.length.to_le_bytes());
    }
}

fn write_page_index(bytes: &mut [u8], offset: usize, index: PageIndex) {
    bytes[offset..offset + 8].copy_from_slice(&index.value().to_le_bytes());
}

fn read_page_index(bytes: &[u8], offset: usize) -> PageIndex {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    PageIndex::new(i64::from_le_bytes(raw))
}

/// Page 0: the storage's identity, version, and root pointers (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct HeadingPageHeader {
    pub common: CommonHeader,
    pub page_size: u32,
    pub on_disk_structure_version: u32,
    pub access_method: AccessMethodKind,
    pub fsm_page_index: PageIndex,
    pub access_method_page_index: PageIndex,
}

impl HeadingPageHeader {
    pub fn new(page_size: u32, structure_version: u32, access_method: AccessMethodKind) -> Self {
        Self {
            common: CommonHeader {
                page_type: PageType::Heading,
                size_class: SizeClass::NotApplicable,
                length: HEADING_HEADER_SIZE as u16,
            },
            page_size,
            on_disk_structure_version: structure_version,
            access_method,
            fsm_page_index: PageIndex::FSM_START,
            access_method_page_index: PageIndex::INVALID,
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        let common = CommonHeader::read(bytes)?;
        if common.page_type != PageType::Heading {
            return Err(StorageError::storage_format("page 0 is not a Heading page"));
        }
        if bytes.len() < HEADING_HEADER_SIZE {
            return Err(StorageError::storage_format("heading page truncated"));
        }
        let page_size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let on_disk_structure_version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let access_method = AccessMethodKind::from_byte(bytes[12])
            .ok_or_else(|| StorageError::storage_format("unknown access method tag"))?;
        let fsm_page_index = read_page_index(bytes, 13);
        let access_method_page_index = read_page_index(bytes, 21);
        Ok(Self {
            common,
            page_size,
            on_disk_structure_version,
            access_method,
            fsm_page_index,
            access_method_page_index,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        self.common.write(bytes);
        bytes[4..8].copy_from_slice(&self.page_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.on_disk_structure_version.to_le_bytes());
        bytes[12] = self.access_method as u8;
        write_page_index(bytes, 13, self.fsm_page_index);
        write_page_index(bytes, 21, self.access_method_page_index);
    }
}

/// A page of the free-space-map chain (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct FreeSpaceMapPageHeader {
    pub common: CommonHeader,
    pub start_page_index: PageIndex,
    pub previous_page_index: PageIndex,
    pub next_page_index: PageIndex,
    pub base_page_index: PageIndex,
}

impl FreeSpaceMapPageHeader {
    pub fn new(start_page_index: PageIndex, base_page_index: PageIndex) -> Self {
        Self {
            common: CommonHeader {
                page_type: PageType::FreeSpaceMap,
                size_class: SizeClass::NotApplicable,
                length: FSM_HEADER_SIZE as u16,
            },
            start_page_index,
            previous_page_index: PageIndex::INVALID,
            next_page_index: PageIndex::INVALID,
            base_page_index,
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        let common = CommonHeader::read(bytes)?;
        if common.page_type != PageType::FreeSpaceMap {
            return Err(StorageError::storage_format("expected a FreeSpaceMap page"));
        }
        if bytes.len() < FSM_HEADER_SIZE {
            return Err(StorageError::storage_format("FSM page truncated"));
        }
        Ok(Self {
            common,
            start_page_index: read_page_index(bytes, 4),
            previous_page_index: read_page_index(bytes, 12),
            next_page_index: read_page_index(bytes, 20),
            base_page_index: read_page_index(bytes, 28),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        self.common.write(bytes);
        write_page_index(bytes, 4, self.start_page_index);
        write_page_index(bytes, 12, self.previous_page_index);
        write_page_index(bytes, 20, self.next_page_index);
        write_page_index(bytes, 28, self.base_page_index);
    }
}

/// A B+Tree node page header (spec.md §3, §6). `SizeClass` on the common
/// header must never be `NotApplicable` or `MultiPage` for this page type.
#[derive(Debug, Clone, Copy)]
pub struct BPlusTreeNodePageHeader {
    pub common: CommonHeader,
    pub parent_page_index: PageIndex,
    pub previous_page_index: PageIndex,
    pub next_page_index: PageIndex,
    pub is_leaf: bool,
}

impl BPlusTreeNodePageHeader {
    pub fn new_leaf() -> Self {
        Self {
            common: CommonHeader {
                page_type: PageType::BPlusTreeNode,
                size_class: SizeClass::Class7,
                length: BTREE_NODE_HEADER_SIZE as u16,
            },
            parent_page_index: PageIndex::INVALID,
            previous_page_index: PageIndex::INVALID,
            next_page_index: PageIndex::INVALID,
            is_leaf: true,
        }
    }

    pub fn new_interior() -> Self {
        Self {
            is_leaf: false,
            ..Self::new_leaf()
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        let common = CommonHeader::read(bytes)?;
        if common.page_type != PageType::BPlusTreeNode {
            return Err(StorageError::storage_format("expected a BPlusTreeNode page"));
        }
        if common.size_class == SizeClass::NotApplicable || common.size_class == SizeClass::MultiPage {
            return Err(StorageError::storage_format(
                "BPlusTreeNode page carries an invalid size class",
            ));
        }
        if bytes.len() < BTREE_NODE_HEADER_SIZE {
            return Err(StorageError::storage_format("B+Tree node page truncated"));
        }
        Ok(Self {
            common,
            parent_page_index: read_page_index(bytes, 4),
            previous_page_index: read_page_index(bytes, 12),
            next_page_index: read_page_index(bytes, 20),
            is_leaf: bytes[28] != 0,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        self.common.write(bytes);
        write_page_index(bytes, 4, self.parent_page_index);
        write_page_index(bytes, 12, self.previous_page_index);
        write_page_index(bytes, 20, self.next_page_index);
        bytes[28] = self.is_leaf as u8;
        bytes[29] = 0; // padding
    }
}

/// A fragment of a multi-page blob chain (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct MultiPageHeader {
    pub common: CommonHeader,
    pub start_page_index: PageIndex,
    pub previous_page_index: PageIndex,
    pub next_page_index: PageIndex,
    /// Size-class hint for the overall blob this fragment belongs to
    /// (spec.md §3 `SizeRange`), used to validate the chain on read
    /// (spec.md invariant 6).
    pub size_range: SizeClass,
}

impl MultiPageHeader {
    pub fn new(start_page_index: PageIndex, size_range: SizeClass) -> Self {
        Self {
            common: CommonHeader {
                page_type: PageType::MultiPage,
                size_class: SizeClass::MultiPage,
                length: MULTI_PAGE_HEADER_SIZE as u16,
            },
            start_page_index,
            previous_page_index: PageIndex::INVALID,
            next_page_index: PageIndex::INVALID,
            size_range,
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        let common = CommonHeader::read(bytes)?;
        if common.page_type != PageType::MultiPage {
            return Err(StorageError::storage_format("expected a MultiPage page"));
        }
        if bytes.len() < MULTI_PAGE_HEADER_SIZE {
            return Err(StorageError::storage_format("multi-page fragment truncated"));
        }
        let size_range = SizeClass::from_byte(bytes[28])
            .ok_or_else(|| StorageError::storage_format("unknown size range byte"))?;
        Ok(Self {
            common,
            start_page_index: read_page_index(bytes, 4),
            previous_page_index: read_page_index(bytes, 12),
            next_page_index: read_page_index(bytes, 20),
            size_range,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        self.common.write(bytes);
        write_page_index(bytes, 4, self.start_page_index);
        write_page_index(bytes, 12, self.previous_page_index);
        write_page_index(bytes, 20, self.next_page_index);
        bytes[28] = self.size_range as u8;
    }
}
