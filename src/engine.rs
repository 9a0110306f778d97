//! Thin binding to the embedded LSM engine (RocksDB).
//!
//! Everything engine-specific lives here; the rest of the crate sees only
//! the collaborator contract the store relies on: open (writable or
//! read-only), pinned point reads, batched writes, ordered iteration, WAL
//! sync, full compaction ("flatten"), and a value-log GC pass that reports
//! whether anything was left to rewrite.
//!
//! Value separation is RocksDB's blob-file machinery: values at or above
//! the configured threshold land in blob files, and stale blob data is
//! rewritten by compaction. A GC pass consults the live blob garbage ratio
//! and compacts only when it exceeds the caller's threshold, which is what
//! gives the online GC loop its terminating "no rewrite" signal.

use std::path::Path;
use std::path::PathBuf;

use rocksdb::BlockBasedOptions;
use rocksdb::Cache;
use rocksdb::DB;
use rocksdb::DBCompressionType;
use rocksdb::DBPinnableSlice;
use rocksdb::Direction;
use rocksdb::IteratorMode;
use rocksdb::WriteBatch;
use rocksdb::WriteOptions;
use snafu::ResultExt;
use tracing::debug;

use crate::error::BackendSnafu;
use crate::error::Result;
use crate::options::Options;

/// Outcome of one value-log GC pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLogPass {
    /// Stale data was rewritten; another pass may find more.
    Rewritten,
    /// Nothing left to rewrite at the given threshold.
    NoRewrite,
}

/// One open engine instance rooted at a directory.
pub struct Engine {
    db: DB,
    path: PathBuf,
    sync_writes: bool,
    read_only: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open (creating if missing, unless read-only) an engine at `path`.
    pub fn open(opts: &Options, path: &Path, read_only: bool) -> Result<Engine> {
        let mut db_opts = rocksdb::Options::default();
        db_opts.create_if_missing(!read_only);
        db_opts.set_write_buffer_size(opts.write_buffer_size);
        db_opts.set_compression_type(DBCompressionType::Snappy);
        db_opts.set_max_subcompactions(default_workers());

        // Key-value separation: block payloads go to the value log, the
        // LSM keeps keys and small values.
        db_opts.set_enable_blob_files(true);
        db_opts.set_min_blob_size(opts.min_blob_size);
        db_opts.set_enable_blob_gc(true);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_block_cache(&Cache::new_lru_cache(opts.block_cache_size));
        db_opts.set_block_based_table_factory(&block_opts);

        let db = if read_only {
            DB::open_for_read_only(&db_opts, path, false)
        } else {
            DB::open(&db_opts, path)
        }
        .context(BackendSnafu {
            op: format!("failed to open engine at {}", path.display()),
        })?;

        Ok(Engine {
            db,
            path: path.to_path_buf(),
            sync_writes: opts.sync_writes,
            read_only,
        })
    }

    /// Directory this engine lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point read without copying the value out of the block cache.
    pub fn get_pinned(&self, key: &[u8]) -> Result<Option<DBPinnableSlice<'_>>> {
        self.db.get_pinned(key).context(BackendSnafu {
            op: "failed to read from engine",
        })
    }

    /// Apply a write batch, honoring the configured sync policy.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts).context(BackendSnafu {
            op: "failed to apply write batch",
        })
    }

    /// Ordered iteration over every entry whose key starts with `prefix`.
    ///
    /// An empty prefix iterates the whole store. Errors surface in-stream;
    /// iteration past the prefix range is cut off.
    pub fn iter<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + 'a {
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix, Direction::Forward)
        };
        let prefix = prefix.to_vec();
        self.db.iterator(mode).take_while(move |item| match item {
            Ok((key, _)) => key.starts_with(&prefix),
            Err(_) => true,
        })
    }

    /// Durably sync the write-ahead log.
    pub fn sync_wal(&self) -> Result<()> {
        self.db.flush_wal(true).context(BackendSnafu {
            op: "failed to sync engine WAL",
        })
    }

    /// Full manual compaction across the whole key space.
    ///
    /// `workers` is applied as the subcompaction width; the engine treats
    /// it as a hint and the call degrades to a serial compaction when the
    /// hint cannot be applied.
    pub fn flatten(&self, workers: u32) -> Result<()> {
        if let Err(err) = self
            .db
            .set_options(&[("max_subcompactions", &workers.to_string())])
        {
            debug!(%err, workers, "engine ignored subcompaction hint");
        }
        self.db.compact_range::<&[u8], &[u8]>(None, None);
        Ok(())
    }

    /// One value-log GC pass at the given stale-data threshold.
    pub fn value_log_gc(&self, threshold: f64) -> Result<ValueLogPass> {
        let live = self
            .db
            .property_int_value("rocksdb.live-blob-file-size")
            .context(BackendSnafu {
                op: "failed to read live blob size",
            })?
            .unwrap_or(0);
        let garbage = self
            .db
            .property_int_value("rocksdb.live-blob-file-garbage-size")
            .context(BackendSnafu {
                op: "failed to read blob garbage size",
            })?
            .unwrap_or(0);

        if live == 0 || (garbage as f64) < threshold * (live as f64) {
            return Ok(ValueLogPass::NoRewrite);
        }

        debug!(live, garbage, threshold, "rewriting value log");
        self.db.compact_range::<&[u8], &[u8]>(None, None);
        Ok(ValueLogPass::Rewritten)
    }

    /// Flush memtables and the WAL, then stop background work.
    ///
    /// Memtables are flushed to tables, not just to the log: a read-only
    /// open ignores the WAL and would otherwise miss recent writes. The
    /// handle itself is released on drop; a clone of the `Arc` held by a
    /// slow iterator keeps the files open until it finishes, which is safe
    /// under POSIX unlink semantics.
    pub fn close(&self) -> Result<()> {
        let flushed = if self.read_only {
            Ok(())
        } else {
            self.db
                .flush()
                .context(BackendSnafu {
                    op: "failed to flush engine",
                })
                .and_then(|()| self.sync_wal())
        };
        self.db.cancel_all_background_work(true);
        flushed
    }
}

/// Subcompaction width used when the caller does not supply one:
/// `ncpu / 2`, clamped to `[2, 7]`.
pub fn default_workers() -> u32 {
    let ncpu = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4);
    (ncpu / 2).clamp(2, 7) as u32
}
