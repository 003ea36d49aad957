//! DataTanker: an embedded, single-process key-value storage engine with a
//! B+Tree access method over a paged file (spec.md §1-2).
//!
//! [`Storage`] is the façade callers open a database through; everything
//! below it — the paged file ([`storage::page_store`]), the free-space map
//! ([`storage::fsm`]), the blob allocator ([`storage::blob`]) and the
//! B+Tree itself ([`btree`]) — is an implementation detail reachable only
//! through this type.

pub mod btree;
pub mod buffer;
pub mod error;
pub mod page;
pub mod storage;
pub mod types;

use crate::btree::BPlusTree;
use crate::buffer::{BufferPool, BufferPoolImpl};
use crate::error::{Result, StorageError};
use crate::storage::StorageFacade;
use crate::types::StorageSettings;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Page/entry accounting for a storage, grounded in spec.md §8 property 5
/// ("total data pages = sum of live blobs' pages + live tree pages + FSM
/// pages + 1").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Total pages in the backing file, including the heading page.
    pub total_pages: u64,
    /// Pages making up the free-space map chain.
    pub fsm_pages: u64,
    /// Pages making up the B+Tree's own node structure.
    pub tree_pages: u64,
    /// Pages making up every live blob's out-of-line fragment chain.
    pub blob_pages: u64,
    /// Number of live key/value entries.
    pub entry_count: u64,
}

struct Inner {
    facade: StorageFacade,
    buffer_pool: Arc<BufferPoolImpl>,
    tree: BPlusTree,
}

impl Inner {
    fn open(facade: StorageFacade, settings: &StorageSettings) -> Result<Self> {
        let store = Arc::clone(facade.store());
        let buffer_pool = Arc::new(BufferPoolImpl::new(store, settings.buffer_pool_size));
        let fsm_root = facade.fsm_root();
        let root = facade.access_method_root()?;
        let tree = BPlusTree::new(Arc::clone(facade.store()), Arc::clone(&buffer_pool), fsm_root, root);
        Ok(Self {
            facade,
            buffer_pool,
            tree,
        })
    }

    /// Persist the tree's current root to the heading page if it moved —
    /// every insert/delete that splits or collapses the root changes this.
    fn sync_root(&mut self) -> Result<()> {
        let current = self.tree.root();
        if current != self.facade.access_method_root()? {
            self.facade.set_access_method_root(current)?;
        }
        Ok(())
    }
}

/// An open DataTanker storage.
///
/// All public operations are serialized by an internal mutex (spec.md §5):
/// callers may share a `Storage` across threads, but only one operation
/// executes at a time. A second `Storage` over the same path — in this
/// process or another — fails at open time with [`StorageError::Io`], the
/// advisory file lock's rejection (spec.md §5).
pub struct Storage {
    inner: Mutex<Inner>,
}

impl Storage {
    /// Create a brand new storage at `path`. Fails with
    /// [`StorageError::DuplicateStorage`] if a file already exists there.
    pub fn create_new(path: impl AsRef<Path>, settings: StorageSettings) -> Result<Self> {
        let facade = StorageFacade::create_new(path.as_ref(), &settings)?;
        Ok(Self {
            inner: Mutex::new(Inner::open(facade, &settings)?),
        })
    }

    /// Open an existing storage at `path`. Fails with
    /// [`StorageError::NotSupported`] if the on-disk page size, structure
    /// version or access method disagree with this crate's own supported
    /// version (spec.md §4.6).
    pub fn open_existing(path: impl AsRef<Path>, settings: StorageSettings) -> Result<Self> {
        let facade = StorageFacade::open_existing(path.as_ref(), &settings)?;
        Ok(Self {
            inner: Mutex::new(Inner::open(facade, &settings)?),
        })
    }

    /// Open `path` if it exists, otherwise create it fresh.
    pub fn open_or_create(path: impl AsRef<Path>, settings: StorageSettings) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open_existing(path, settings)
        } else {
            Self::create_new(path, settings)
        }
    }

    /// Look up `key`, returning its value if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.get(key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.contains(key)
    }

    /// Insert or overwrite `key` with `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.put(key, value)?;
        inner.sync_root()
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.facade.ensure_open()?;
        let removed = inner.tree.remove(key)?;
        inner.sync_root()?;
        Ok(removed)
    }

    /// Number of live entries.
    pub fn count(&self) -> Result<u64> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.count()
    }

    /// Smallest key in the storage.
    pub fn min_key(&self) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.min_key()
    }

    /// Largest key in the storage.
    pub fn max_key(&self) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.max_key()
    }

    /// Smallest key strictly greater than `key`.
    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.next_key(key)
    }

    /// Largest key strictly less than `key`.
    pub fn previous_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.previous_key(key)
    }

    /// Entries with keys in `[start, end)`, either bound unbounded when
    /// `None`. Eagerly materialized; see [`Storage::cursor`] to stream.
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.scan(start, end)
    }

    /// Open a streaming cursor over `[start, end)`, for callers that don't
    /// want the whole range materialized at once. The cursor reads through
    /// the same store and buffer pool directly rather than holding this
    /// `Storage`'s lock, so interleaving it with mutating calls is the
    /// caller's responsibility.
    pub fn cursor(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<btree::Cursor> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        inner.tree.cursor(start, end)
    }

    /// Page and entry accounting (spec.md §8 property 5).
    pub fn stats(&self) -> Result<Stats> {
        let inner = self.inner.lock();
        inner.facade.ensure_open()?;
        let total_pages = inner.facade.store().page_count()? as u64;
        let fsm_pages = storage::fsm::page_count(inner.facade.store().as_ref(), inner.facade.fsm_root())?;
        let (tree_pages, blob_pages, entry_count) = inner.tree.page_stats()?;
        Ok(Stats {
            total_pages,
            fsm_pages,
            tree_pages,
            blob_pages,
            entry_count,
        })
    }

    /// Write all cached mutations to stable storage.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.buffer_pool.flush_all()?;
        inner.facade.flush()
    }

    /// Flush and release the advisory file lock. Idempotent: closing an
    /// already-closed storage is a no-op (spec.md §4.6).
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.lock();
        if !inner.facade.is_open() {
            return Ok(());
        }
        inner.buffer_pool.flush_all()?;
        inner.facade.close()
    }

    /// Whether this storage has not yet been closed.
    pub fn is_open(&self) -> bool {
        self.inner.lock().facade.is_open()
    }

    /// The page size this storage was created with.
    pub fn page_size(&self) -> u32 {
        self.inner.lock().facade.page_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_put_close_reopen_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let settings = StorageSettings::with_page_size(4096).unwrap();

        {
            let storage = Storage::create_new(&path, settings.clone()).unwrap();
            storage.put(b"a", b"1").unwrap();
            storage.put(b"b", b"2").unwrap();
            storage.close().unwrap();
        }

        let storage = Storage::open_existing(&path, settings).unwrap();
        assert_eq!(storage.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(storage.count().unwrap(), 2);
    }

    #[test]
    fn random_order_keys_scan_in_ascending_order() {
        use rand::seq::SliceRandom;

        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let storage = Storage::create_new(&path, StorageSettings::default()).unwrap();

        let mut keys: Vec<String> = (0..1000).map(|i| format!("{:03}", i)).collect();
        keys.shuffle(&mut rand::thread_rng());
        for k in &keys {
            storage.put(k.as_bytes(), b"v").unwrap();
        }

        let scanned = storage.range(None, None).unwrap();
        let scanned_keys: Vec<String> = scanned
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();
        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(scanned_keys, expected);
    }

    #[test]
    fn large_blob_round_trips_and_is_released_on_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let settings = StorageSettings::with_page_size(4096).unwrap();
        let storage = Storage::create_new(&path, settings).unwrap();

        let value = vec![0x5Au8; 1024 * 1024];
        storage.put(b"big", &value).unwrap();
        assert_eq!(storage.get(b"big").unwrap(), Some(value));

        let stats_before = storage.stats().unwrap();
        assert!(stats_before.blob_pages > 0);

        assert!(storage.remove(b"big").unwrap());
        let stats_after = storage.stats().unwrap();
        assert_eq!(stats_after.blob_pages, 0);
    }

    #[test]
    fn opening_unsupported_structure_version_fails_without_mutating_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let settings = StorageSettings::default();
        {
            let storage = Storage::create_new(&path, settings.clone()).unwrap();
            storage.put(b"k", b"v").unwrap();
            storage.close().unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        // OnDiskStructureVersion lives at offset 8 (common header is 4 bytes).
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        // Heading checksum covers bytes [0, 32); recompute it so the
        // corrupted version is what's read, rather than rejected earlier
        // as a checksum mismatch.
        let checksum = crc32fast::hash(&bytes[0..32]);
        bytes[32..36].copy_from_slice(&checksum.to_le_bytes());
        let before = bytes.clone();
        std::fs::write(&path, &bytes).unwrap();

        let result = Storage::open_existing(&path, settings);
        assert!(matches!(result, Err(StorageError::NotSupported(_))));

        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn delete_every_other_key_keeps_tree_balanced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let storage = Storage::create_new(&path, StorageSettings::default()).unwrap();

        for i in 0..10_000u32 {
            let key = format!("{:05}", i);
            storage.put(key.as_bytes(), b"v").unwrap();
        }
        for i in (0..10_000u32).step_by(2) {
            let key = format!("{:05}", i);
            assert!(storage.remove(key.as_bytes()).unwrap());
        }
        assert_eq!(storage.count().unwrap(), 5000);
        for i in (1..10_000u32).step_by(2) {
            let key = format!("{:05}", i);
            assert_eq!(storage.get(key.as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
    }

    #[test]
    fn double_open_same_process_fails_with_io_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let settings = StorageSettings::default();
        let _first = Storage::create_new(&path, settings.clone()).unwrap();
        let second = Storage::open_existing(&path, settings);
        assert!(matches!(second, Err(StorageError::Io(_))));
    }

    #[test]
    fn remove_missing_key_is_a_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let storage = Storage::create_new(&path, StorageSettings::default()).unwrap();
        storage.put(b"a", b"1").unwrap();
        assert!(!storage.remove(b"missing").unwrap());
        assert_eq!(storage.count().unwrap(), 1);
    }

    #[test]
    fn operations_after_close_fail_with_disposed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let storage = Storage::create_new(&path, StorageSettings::default()).unwrap();
        storage.close().unwrap();
        assert!(matches!(storage.get(b"a"), Err(StorageError::Disposed)));
        storage.close().unwrap(); // idempotent
    }

    #[test]
    fn cursor_streams_the_same_entries_as_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let storage = Storage::create_new(&path, StorageSettings::default()).unwrap();
        for i in 0..50u32 {
            storage.put(format!("k{:02}", i).as_bytes(), b"v").unwrap();
        }
        let expected = storage.range(None, None).unwrap();
        let mut cursor = storage.cursor(None, None).unwrap();
        let mut streamed = Vec::new();
        while let Some(entry) = cursor.next().unwrap() {
            streamed.push(entry);
        }
        assert_eq!(streamed, expected);
    }
}
