//! Error types for block store operations.

use std::io;
use std::path::PathBuf;

use cid::Cid;
use snafu::Snafu;

/// Convenience alias used throughout the crate.
pub type Result<T, E = BlockstoreError> = std::result::Result<T, E>;

/// Errors from block store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BlockstoreError {
    /// The store has been closed (or is closing).
    #[snafu(display("blockstore closed"))]
    Closed,

    /// No block is stored under the given cid.
    #[snafu(display("block not found: {cid}"))]
    NotFound {
        /// The cid that was looked up.
        cid: Cid,
    },

    /// The multihash is not in the supported digest table, or its digest
    /// is not 256 bits wide.
    #[snafu(display("unsupported multihash (code 0x{code:x}, {size} byte digest)"))]
    UnsupportedDigest {
        /// Multihash type code.
        code: u64,
        /// Digest length in bytes.
        size: u8,
    },

    /// A storage key's base32 suffix did not decode to a multihash.
    ///
    /// This indicates on-disk corruption or a foreign key in the store
    /// directory.
    #[snafu(display("undecodable storage key 0x{}", hex(key)))]
    UndecodableKey {
        /// The raw key, prefix stripped.
        key: Vec<u8>,
    },

    /// The embedded key-value engine reported an error.
    #[snafu(display("{op}: {source}"))]
    Backend {
        /// What the store was doing when the engine failed.
        op: String,
        /// The underlying engine error.
        source: rocksdb::Error,
    },

    /// The multihash journal reported an I/O error.
    #[snafu(display("multihash journal {op}: {source}"))]
    Journal {
        /// What the store was doing when the journal failed.
        op: String,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Filesystem plumbing around the store directory failed.
    #[snafu(display("{op} {}: {source}", path.display()))]
    Io {
        /// What the store was doing.
        op: String,
        /// The path involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A move is already underway.
    #[snafu(display("move in progress"))]
    MoveInProgress,

    /// Incompatible garbage-collection options.
    #[snafu(display("conflicting GC options: {message}"))]
    OptionConflict {
        /// Why the options are incompatible.
        message: String,
    },

    /// A write or garbage-collection entry point was invoked on a
    /// read-only store.
    #[snafu(display("blockstore is read-only"))]
    ReadOnly,

    /// The operation's cancellation token fired.
    #[snafu(display("operation cancelled"))]
    Cancelled,
}

impl BlockstoreError {
    /// True for [`BlockstoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlockstoreError::NotFound { .. })
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}
