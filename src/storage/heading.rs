//! The heading page (page 0): a storage's identity, version and root
//! pointers, checksummed the way the teacher's `FileHeader` was (spec.md §3).

use crate::error::{Result, StorageError};
use crate::page::header::HEADING_HEADER_SIZE;
use crate::page::HeadingPageHeader;
use crate::storage::page_store::PageStore;
use crate::types::{AccessMethodKind, PageIndex, STRUCTURE_VERSION};

const CHECKSUM_OFFSET: usize = HEADING_HEADER_SIZE;
const CHECKSUM_SIZE: usize = 4;

/// In-memory view of the heading page, backed by page 0 of the file.
#[derive(Debug, Clone, Copy)]
pub struct Heading {
    pub header: HeadingPageHeader,
}

impl Heading {
    pub fn new(page_size: u32, access_method: AccessMethodKind) -> Self {
        Self {
            header: HeadingPageHeader::new(page_size, STRUCTURE_VERSION, access_method),
        }
    }

    /// Read and checksum-verify the heading page from a freshly-fetched
    /// page 0 buffer.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHECKSUM_OFFSET + CHECKSUM_SIZE {
            return Err(StorageError::storage_format("heading page too short for checksum"));
        }
        let stored = u32::from_le_bytes(bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_SIZE].try_into().unwrap());
        let computed = crc32fast::hash(&bytes[0..CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(StorageError::storage_format("heading page checksum mismatch"));
        }
        let header = HeadingPageHeader::read(bytes)?;
        Ok(Self { header })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        self.header.write(bytes);
        let checksum = crc32fast::hash(&bytes[0..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Validate that this engine can open a storage carrying this heading
    /// (spec.md §4.6, §7 `NotSupportedError`).
    pub fn validate_compatible(&self) -> Result<()> {
        if self.header.on_disk_structure_version != STRUCTURE_VERSION {
            return Err(StorageError::not_supported(format!(
                "on-disk structure version {} is not supported (expected {})",
                self.header.on_disk_structure_version, STRUCTURE_VERSION
            )));
        }
        if self.header.access_method != AccessMethodKind::BPlusTree {
            return Err(StorageError::not_supported(
                "only the B+Tree access method is implemented",
            ));
        }
        Ok(())
    }

    pub fn fsm_page_index(&self) -> PageIndex {
        self.header.fsm_page_index
    }

    pub fn access_method_page_index(&self) -> PageIndex {
        self.header.access_method_page_index
    }

    pub fn set_access_method_page_index(&mut self, index: PageIndex) {
        self.header.access_method_page_index = index;
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }
}

/// Load the heading page (page 0) from a store that has already been
/// created with at least one page.
pub fn load(store: &dyn PageStore) -> Result<Heading> {
    let buf = store.fetch_page(PageIndex::HEADING)?;
    Heading::read(&buf)
}

/// Persist the heading page back to page 0.
pub fn save(store: &dyn PageStore, heading: &Heading) -> Result<()> {
    let mut buf = vec![0u8; store.page_size() as usize];
    heading.write(&mut buf);
    store.update_page(PageIndex::HEADING, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_and_validates_checksum() {
        let heading = Heading::new(4096, AccessMethodKind::BPlusTree);
        let mut bytes = vec![0u8; 4096];
        heading.write(&mut bytes);

        let restored = Heading::read(&bytes).unwrap();
        assert_eq!(restored.page_size(), 4096);
        restored.validate_compatible().unwrap();
    }

    #[test]
    fn detects_corrupted_checksum() {
        let heading = Heading::new(4096, AccessMethodKind::BPlusTree);
        let mut bytes = vec![0u8; 4096];
        heading.write(&mut bytes);
        bytes[5] ^= 0xFF;
        assert!(Heading::read(&bytes).is_err());
    }

    #[test]
    fn rejects_radix_tree_tag() {
        let heading = Heading::new(4096, AccessMethodKind::RadixTree);
        assert!(heading.validate_compatible().is_err());
    }
}
