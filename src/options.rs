//! Store configuration.

use std::path::Path;
use std::path::PathBuf;

use crate::journal::FileAdvisor;

/// Options for opening a [`crate::Blockstore`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Store directory; created if absent.
    pub path: PathBuf,

    /// Namespace bytes prepended to every storage key. Default: empty.
    ///
    /// A store instance only parses keys carrying its own prefix; sharing a
    /// directory between stores configured with different prefixes is
    /// unsupported.
    pub prefix: Vec<u8>,

    /// Open without write access: no journal is opened, and writes and
    /// garbage collection fail with `ReadOnly`.
    pub read_only: bool,

    /// Fsync every write batch. Default: false; durability is obtained in
    /// bulk via [`crate::Blockstore::flush`].
    pub sync_writes: bool,

    /// Engine block cache size in bytes (default: 256 MB).
    pub block_cache_size: usize,

    /// Engine write buffer size in bytes (default: 64 MB).
    pub write_buffer_size: usize,

    /// Values at or above this size are separated into the value log
    /// (default: 512 bytes, which separates essentially every block).
    pub min_blob_size: u64,

    /// Optional hook applied to the journal file at open time.
    pub journal_advisor: Option<FileAdvisor>,
}

impl Options {
    /// Defaults tuned for production workloads at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            prefix: Vec::new(),
            read_only: false,
            sync_writes: false,
            block_cache_size: 256 * 1024 * 1024,
            write_buffer_size: 64 * 1024 * 1024,
            min_blob_size: 512,
            journal_advisor: None,
        }
    }

    /// Small buffers and no syncing, for tests.
    pub fn for_testing(path: impl AsRef<Path>) -> Self {
        Self {
            block_cache_size: 8 * 1024 * 1024,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::new(path.as_ref())
        }
    }

    /// Set the key namespace prefix.
    pub fn with_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Open the store read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Fsync every write batch instead of relying on `flush`.
    pub fn with_sync_writes(mut self) -> Self {
        self.sync_writes = true;
        self
    }
}
