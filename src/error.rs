//! Error types for the storage engine.
//!
//! Follows the taxonomy of spec.md §7: on-disk structural problems
//! (`StorageFormatError`), open-time incompatibilities (`NotSupportedError`),
//! API misuse (`AlreadyOpenError`/`NotOpenError`/`DisposedError`), raw I/O
//! failures (`IOError`), duplicate creation (`DuplicateStorageError`), and a
//! distinct "caller required this key to exist" miss (`ValueNotFoundError`)
//! for the APIs that don't just return `None`.

use crate::types::PageIndex;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying file I/O failed. Fatal for the enclosing operation; the
    /// storage's state afterwards is undefined until reopened (spec.md §7).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk structure did not match what the reader expected: a bad
    /// magic value, a short page, a broken sibling/parent link, or an
    /// unexpected page type at a known index. Fatal for the operation; the
    /// storage should be treated as read-only until reopened.
    #[error("storage format error: {0}")]
    StorageFormat(String),

    /// The structure version or access method recorded in the heading page
    /// does not match what the opening engine supports.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// `create_new`/`open_existing`/`open_or_create` was called on a
    /// storage that is already open.
    #[error("storage is already open")]
    AlreadyOpen,

    /// An operation was attempted on a storage that has not been opened.
    #[error("storage is not open")]
    NotOpen,

    /// An operation was attempted on a storage that has been closed.
    #[error("storage has been disposed")]
    Disposed,

    /// `create_new` was invoked on a path that already contains a storage
    /// file set.
    #[error("a storage already exists at this path")]
    DuplicateStorage,

    /// A lookup that requires the key to exist did not find it.
    #[error("value not found")]
    ValueNotFound,

    /// Requested page was not found in the backing file.
    #[error("page {0} not found")]
    PageNotFound(PageIndex),

    /// Page does not have enough space for the operation.
    #[error("page {page_index} is full, need {needed} bytes but only {available} available")]
    PageFull {
        page_index: PageIndex,
        needed: usize,
        available: usize,
    },

    /// Key exceeds the maximum allowed size.
    #[error("key too large: {size} bytes (max: {max})")]
    KeyTooLarge { size: usize, max: usize },

    /// Value exceeds the maximum allowed size.
    #[error("value too large: {size} bytes (max: {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// Invalid operation for the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl StorageError {
    /// Create a storage-format error with a message.
    pub fn storage_format(msg: impl Into<String>) -> Self {
        Self::StorageFormat(msg.into())
    }

    /// Create a not-supported error with a message.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create an invalid-operation error with a message.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}
