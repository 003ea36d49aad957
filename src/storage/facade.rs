//! Storage lifecycle: `create_new` / `open_existing` / `open_or_create` /
//! `close` / `flush` (spec.md §4.6).

use crate::error::{Result, StorageError};
use crate::page::FreeSpaceMapPageHeader;
use crate::storage::heading::{self, Heading};
use crate::storage::info;
use crate::storage::page_store::{FilePageStore, PageStore};
use crate::types::{validate_page_size, PageIndex, StorageSettings, MIN_PAGE_SIZE};
use parking_lot::RwLock;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owns the paged file, the heading page, and the storage's open/closed
/// lifecycle. The access method (B+Tree) is layered on top of this.
pub struct StorageFacade {
    store: Arc<dyn PageStore>,
    heading: RwLock<Heading>,
    path: PathBuf,
    disposed: AtomicBool,
}

fn probe_page_size(path: &Path) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; MIN_PAGE_SIZE as usize];
    file.read_exact(&mut buf)?;
    let heading = Heading::read(&buf)?;
    Ok(heading.page_size())
}

impl StorageFacade {
    pub fn create_new(path: &Path, settings: &StorageSettings) -> Result<Self> {
        validate_page_size(settings.page_size)?;
        let store = FilePageStore::create_new(path, settings.page_size, settings.sync_on_write)?;
        store.lock_exclusive()?;

        let heading_page = store.create_page()?;
        debug_assert_eq!(heading_page, PageIndex::HEADING);
        let fsm_root = store.create_page()?;
        debug_assert_eq!(fsm_root, PageIndex::FSM_START);

        let fsm_header = FreeSpaceMapPageHeader::new(fsm_root, PageIndex::new(0));
        let mut fsm_buf = vec![0u8; settings.page_size as usize];
        fsm_header.write(&mut fsm_buf);
        store.update_page(fsm_root, &fsm_buf)?;

        let heading = Heading::new(settings.page_size, settings.access_method);
        heading::save(&store, &heading)?;
        info::write(&FilePageStore::info_sidecar_path(path), settings.access_method)?;

        log::info!("storage: created {} (page size {})", path.display(), settings.page_size);
        Ok(Self {
            store: Arc::new(store),
            heading: RwLock::new(heading),
            path: path.to_path_buf(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn open_existing(path: &Path, settings: &StorageSettings) -> Result<Self> {
        if !path.exists() {
            return Err(StorageError::storage_format("storage file does not exist"));
        }
        let page_size = probe_page_size(path)?;
        let store = FilePageStore::open_existing(path, page_size, settings.sync_on_write)?;
        store.lock_exclusive()?;

        let heading = heading::load(&store)?;
        heading.validate_compatible()?;

        log::info!("storage: opened {}", path.display());
        Ok(Self {
            store: Arc::new(store),
            heading: RwLock::new(heading),
            path: path.to_path_buf(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn open_or_create(path: &Path, settings: &StorageSettings) -> Result<Self> {
        if path.exists() {
            Self::open_existing(path, settings)
        } else {
            Self::create_new(path, settings)
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::Disposed);
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    pub fn page_size(&self) -> u32 {
        self.store.page_size()
    }

    pub fn fsm_root(&self) -> PageIndex {
        self.heading.read().fsm_page_index()
    }

    pub fn access_method_root(&self) -> Result<PageIndex> {
        self.check_open()?;
        Ok(self.heading.read().access_method_page_index())
    }

    pub fn set_access_method_root(&self, index: PageIndex) -> Result<()> {
        self.check_open()?;
        let mut heading = self.heading.write();
        heading.set_access_method_page_index(index);
        heading::save(self.store.as_ref(), &heading)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.store.flush()
    }

    pub fn close(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.flush()?;
        self.store.unlock()?;
        log::info!("storage: closed {}", self.path.display());
        Ok(())
    }

    /// Whether this facade has not yet been closed.
    pub fn is_open(&self) -> bool {
        !self.disposed.load(Ordering::Acquire)
    }

    /// Check the open/disposed state, surfacing `StorageError::Disposed`
    /// the way every other facade accessor does (spec.md §7
    /// `DisposedError`). Exposed so the B+Tree-facing `Storage` wrapper can
    /// guard mutating operations the same way.
    pub fn ensure_open(&self) -> Result<()> {
        self.check_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessMethodKind;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_preserves_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let settings = StorageSettings::with_page_size(4096).unwrap();

        {
            let facade = StorageFacade::create_new(&path, &settings).unwrap();
            facade.set_access_method_root(PageIndex::new(2)).unwrap();
            facade.close().unwrap();
        }

        let facade = StorageFacade::open_existing(&path, &settings).unwrap();
        assert_eq!(facade.access_method_root().unwrap(), PageIndex::new(2));
        assert_eq!(facade.page_size(), 4096);
    }

    #[test]
    fn create_new_rejects_duplicate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let settings = StorageSettings::default();
        StorageFacade::create_new(&path, &settings).unwrap();
        assert!(StorageFacade::create_new(&path, &settings).is_err());
    }

    #[test]
    fn operations_after_close_fail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let settings = StorageSettings::default();
        let facade = StorageFacade::create_new(&path, &settings).unwrap();
        facade.close().unwrap();
        assert!(facade.access_method_root().is_err());
    }

    #[test]
    fn info_sidecar_records_access_method() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let settings = StorageSettings::default();
        StorageFacade::create_new(&path, &settings).unwrap();
        let info_path = FilePageStore::info_sidecar_path(&path);
        assert_eq!(info::read(&info_path), Some(AccessMethodKind::BPlusTree));
    }
}
