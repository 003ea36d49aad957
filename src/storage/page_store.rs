//! Paged file I/O (spec.md §4.1).
//!
//! [`PageStore`] abstracts raw page read/write/allocate operations behind a
//! trait, the way the teacher's `DiskManager` abstracted disk I/O — so the
//! rest of the engine (free-space map, blob allocator, B+Tree) never touches
//! `std::fs` directly.

use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::types::PageIndex;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Read/write/allocate operations over a storage's paged file.
pub trait PageStore: Send + Sync {
    fn page_size(&self) -> u32;

    /// Number of pages currently in the file, including page 0.
    fn page_count(&self) -> Result<i64>;

    /// Append a new zeroed page and return its index.
    fn create_page(&self) -> Result<PageIndex>;

    fn fetch_page(&self, index: PageIndex) -> Result<PageBuf>;

    fn update_page(&self, index: PageIndex, data: &[u8]) -> Result<()>;

    /// Zero a page's contents. The index itself is not reclaimed here —
    /// reuse is the free-space map's responsibility (spec.md §4.2).
    fn remove_page(&self, index: PageIndex) -> Result<()>;

    fn flush(&self) -> Result<()>;

    /// Release the advisory exclusive lock this store's backing file holds,
    /// if any (spec.md §4.6 `close()`).
    fn unlock(&self) -> Result<()>;
}

/// File-backed [`PageStore`].
pub struct FilePageStore {
    file: RwLock<File>,
    page_size: u32,
    sync_on_write: bool,
}

impl FilePageStore {
    /// Create a brand new, empty paged file at `path`. Fails if the path
    /// already contains a file (spec.md §4.6 `DuplicateStorageError`).
    pub fn create_new(path: &Path, page_size: u32, sync_on_write: bool) -> Result<Self> {
        if path.exists() {
            return Err(StorageError::DuplicateStorage);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            file: RwLock::new(file),
            page_size,
            sync_on_write,
        })
    }

    /// Open an existing paged file at `path`, recovering `page_size` from
    /// the caller (the heading page is validated separately at a higher
    /// layer once the first page has been read through this store).
    pub fn open_existing(path: &Path, page_size: u32, sync_on_write: bool) -> Result<Self> {
        if !path.exists() {
            return Err(StorageError::storage_format("storage file does not exist"));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: RwLock::new(file),
            page_size,
            sync_on_write,
        })
    }

    /// Acquire an advisory exclusive lock on the underlying file for the
    /// lifetime of this process' handle (spec.md §4.6: a storage is a
    /// single-process engine; concurrent opens from another process must be
    /// rejected rather than silently corrupting the file). A lock already
    /// held — by this process or another — surfaces as the underlying OS
    /// error, mapped to `StorageError::Io` (spec.md §8: "Attempt to open a
    /// path already opened in the same process: fails with IOError").
    pub fn lock_exclusive(&self) -> Result<()> {
        use fs2::FileExt;
        let file = self.file.read();
        file.try_lock_exclusive()?;
        Ok(())
    }

    pub fn still_exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn info_sidecar_path(db_path: &Path) -> PathBuf {
        let mut p = db_path.as_os_str().to_owned();
        p.push(".info");
        PathBuf::from(p)
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Result<i64> {
        let file = self.file.read();
        let len = file.metadata()?.len();
        Ok((len / self.page_size as u64) as i64)
    }

    fn create_page(&self) -> Result<PageIndex> {
        let mut file = self.file.write();
        let len = file.metadata()?.len();
        let index = PageIndex::new((len / self.page_size as u64) as i64);
        let zeros = vec![0u8; self.page_size as usize];
        file.seek(SeekFrom::Start(index.file_offset(self.page_size as usize)))?;
        file.write_all(&zeros)?;
        if self.sync_on_write {
            file.sync_data()?;
        }
        Ok(index)
    }

    fn fetch_page(&self, index: PageIndex) -> Result<PageBuf> {
        if !index.is_valid() {
            return Err(StorageError::PageNotFound(index));
        }
        let mut file = self.file.write();
        let len = file.metadata()?.len();
        let offset = index.file_offset(self.page_size as usize);
        if offset + self.page_size as u64 > len {
            return Err(StorageError::PageNotFound(index));
        }
        let mut buf = vec![0u8; self.page_size as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(PageBuf::from_bytes(&buf, self.page_size as usize))
    }

    fn update_page(&self, index: PageIndex, data: &[u8]) -> Result<()> {
        if !index.is_valid() {
            return Err(StorageError::PageNotFound(index));
        }
        if data.len() != self.page_size as usize {
            return Err(StorageError::invalid_operation(format!(
                "page data must be {} bytes, got {}",
                self.page_size,
                data.len()
            )));
        }
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(index.file_offset(self.page_size as usize)))?;
        file.write_all(data)?;
        if self.sync_on_write {
            file.sync_data()?;
        }
        Ok(())
    }

    fn remove_page(&self, index: PageIndex) -> Result<()> {
        let zeros = vec![0u8; self.page_size as usize];
        self.update_page(index, &zeros)
    }

    fn flush(&self) -> Result<()> {
        let file = self.file.write();
        file.sync_all()?;
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        use fs2::FileExt;
        let file = self.file.read();
        fs2::FileExt::unlock(&*file)?;
        Ok(())
    }
}
