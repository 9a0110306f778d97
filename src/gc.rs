//! Garbage collection: online value-log rewriting and the live relocation
//! ("moving GC") protocol.
//!
//! Online GC compacts in place and loops value-log passes until the engine
//! has nothing left to rewrite. Moving GC rebuilds the entire store in a
//! sibling directory while reads and writes continue, then swings the
//! canonical path over via rename + symlink. Writes issued while the shadow
//! pair is published go to both stores with identical journal buffers, so
//! neither outcome (commit or abort) can lose an acknowledged write.

use std::fs;
use std::io;
use std::mem;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rocksdb::WriteBatch;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::constants::COPY_GROUP_SIZE;
use crate::constants::DEFAULT_GC_THRESHOLD;
use crate::constants::MH_JOURNAL_RECORD_LEN;
use crate::constants::MIN_GC_CHECK_FREQ;
use crate::digest;
use crate::engine::Engine;
use crate::engine::ValueLogPass;
use crate::engine::default_workers;
use crate::error::BackendSnafu;
use crate::error::CancelledSnafu;
use crate::error::IoSnafu;
use crate::error::JournalSnafu;
use crate::error::OptionConflictSnafu;
use crate::error::ReadOnlySnafu;
use crate::error::Result;
use crate::journal::Journal;
use crate::key;
use crate::movelock::MoveState;
use crate::store::Blockstore;

/// Health check invoked between online-GC passes.
pub type HealthCheck = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Options for [`Blockstore::collect_garbage`] and [`Blockstore::gc_once`].
pub struct GcOptions {
    /// Run the full, non-incremental moving GC instead of online passes.
    pub full: bool,
    /// Stale-data threshold in `(0, 1)`; defaults to
    /// [`DEFAULT_GC_THRESHOLD`] when unset.
    pub threshold: Option<f64>,
    /// How often to run the health check between passes; clamped up to
    /// [`MIN_GC_CHECK_FREQ`].
    pub check_freq: Duration,
    /// Health check run on the check cadence; its error aborts the GC.
    pub check: Option<HealthCheck>,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            full: false,
            threshold: None,
            check_freq: MIN_GC_CHECK_FREQ,
            check: None,
        }
    }
}

impl std::fmt::Debug for GcOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcOptions")
            .field("full", &self.full)
            .field("threshold", &self.threshold)
            .field("check_freq", &self.check_freq)
            .field("check", &self.check.as_ref().map(|_| "…"))
            .finish()
    }
}

impl GcOptions {
    /// Request the full moving GC.
    pub fn full() -> Self {
        Self {
            full: true,
            ..Self::default()
        }
    }

    /// Set the stale-data threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Set the health-check cadence.
    pub fn with_check_freq(mut self, check_freq: Duration) -> Self {
        self.check_freq = check_freq;
        self
    }

    /// Install a health check.
    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.check = Some(check);
        self
    }

    fn resolve_threshold(&self) -> Result<f64> {
        let threshold = self.threshold.unwrap_or(DEFAULT_GC_THRESHOLD);
        if !(threshold > 0.0 && threshold < 1.0) {
            return OptionConflictSnafu {
                message: format!("GC threshold {threshold} outside (0, 1)"),
            }
            .fail();
        }
        Ok(threshold)
    }
}

impl Blockstore {
    /// Compact and garbage-collect the store.
    ///
    /// With `full` set this runs the moving GC; otherwise it flattens the
    /// LSM and rewrites the value log until the engine reports nothing
    /// left, running the configured health check in between passes.
    #[instrument(skip_all, fields(full = opts.full))]
    pub fn collect_garbage(&self, ctx: &CancellationToken, opts: GcOptions) -> Result<()> {
        let _access = self.admit()?;
        if ctx.is_cancelled() {
            return CancelledSnafu.fail();
        }
        if self.opts.read_only {
            return ReadOnlySnafu.fail();
        }

        if opts.full {
            return self.moving_gc(ctx);
        }

        let threshold = opts.resolve_threshold()?;
        let check_freq = opts.check_freq.max(MIN_GC_CHECK_FREQ);
        self.online_gc(ctx, threshold, check_freq, opts.check)
    }

    /// Run a single value-log GC pass.
    ///
    /// No flatten first: a single pass touches at most one value-log file
    /// anyway. `full` is rejected here, moving GC is not incremental.
    #[instrument(skip_all)]
    pub fn gc_once(&self, ctx: &CancellationToken, opts: GcOptions) -> Result<()> {
        let _access = self.admit()?;
        if ctx.is_cancelled() {
            return CancelledSnafu.fail();
        }
        if self.opts.read_only {
            return ReadOnlySnafu.fail();
        }
        if opts.full {
            return OptionConflictSnafu {
                message: "full GC requested on the incremental-only entry point",
            }
            .fail();
        }
        let threshold = opts.resolve_threshold()?;

        let _db_lock = self.move_lock.lock_db();
        let db = self.handles().db;
        db.value_log_gc(threshold)?;
        Ok(())
    }

    fn online_gc(
        &self,
        ctx: &CancellationToken,
        threshold: f64,
        check_freq: Duration,
        check: Option<HealthCheck>,
    ) -> Result<()> {
        let _db_lock = self.move_lock.lock_db();
        let db = self.handles().db;

        // Compact first to gather the statistics value-log GC feeds on.
        db.flatten(default_workers())?;

        let mut last_check = Instant::now();
        loop {
            if ctx.is_cancelled() {
                return CancelledSnafu.fail();
            }
            if last_check.elapsed() >= check_freq {
                if let Some(check) = &check {
                    check()?;
                }
                last_check = Instant::now();
                continue;
            }
            if db.value_log_gc(threshold)? == ValueLogPass::NoRewrite {
                return Ok(());
            }
        }
    }

    /// Relocate the store to a fresh sibling directory, symlink the
    /// canonical path to it, and delete the old image.
    ///
    /// New writes are accepted throughout and are persisted to the new
    /// store; if the move aborts they are persisted to the old one. Either
    /// way no acknowledged write is lost.
    pub(crate) fn moving_gc(&self, ctx: &CancellationToken) -> Result<()> {
        self.move_lock.begin_move()?;

        let mut new_path = None;
        let result = self.run_move(ctx, &mut new_path);

        // Teardown runs on both outcomes. A shadow pair still installed
        // here means the move failed after spawning it: discard it.
        let guard = self.move_lock.lock_move();
        let (db_next, journal_next) = {
            let mut handles = self.handles.write();
            (handles.db_next.take(), handles.journal_next.take())
        };
        let next_state = if db_next.is_some() {
            MoveState::Cleanup
        } else {
            MoveState::None
        };
        guard.release(next_state);

        if let Some(db_next) = db_next {
            if let Err(err) = db_next.close() {
                warn!(%err, "error closing shadow engine");
            }
            if let Some(journal_next) = journal_next
                && let Err(err) = journal_next.close()
            {
                warn!(%err, "error closing shadow journal");
            }
            drop(db_next);
            if let Some(path) = &new_path {
                delete_store_dir(path);
            }

            let guard = self.move_lock.lock_move();
            guard.release(MoveState::None);
        }

        result
    }

    fn run_move(&self, ctx: &CancellationToken, new_path_out: &mut Option<PathBuf>) -> Result<()> {
        let base_path = self.opts.path.as_path();

        // Resolve the canonical path first. Placing the sibling next to the
        // resolved directory lets the user symlink the store onto another
        // filesystem; naming it after the canonical basename keeps
        // timestamp suffixes from piling up across successive moves.
        let metadata = fs::symlink_metadata(base_path).context(IoSnafu {
            op: "failed to stat store directory",
            path: base_path.to_path_buf(),
        })?;
        let new_base = if metadata.file_type().is_symlink() {
            let resolved = fs::canonicalize(base_path).context(IoSnafu {
                op: "failed to resolve store symlink",
                path: base_path.to_path_buf(),
            })?;
            match (resolved.parent(), base_path.file_name()) {
                (Some(dir), Some(name)) => dir.join(name),
                _ => resolved,
            }
        } else {
            base_path.to_path_buf()
        };
        let new_path = PathBuf::from(format!("{}.{}", new_base.display(), unix_nanos()));
        *new_path_out = Some(new_path.clone());

        info!(from = %base_path.display(), to = %new_path.display(), "moving blockstore");

        // The new copy is writable by definition; we are about to write it.
        let db_new = Arc::new(Engine::open(&self.opts, &new_path, false)?);
        let journal_new = Arc::new(
            Journal::open(&new_path, self.opts.journal_advisor)
                .context(JournalSnafu { op: "open shadow" })?,
        );

        // Publish the shadow pair. From this moment puts dual-write.
        let guard = self.move_lock.lock_move();
        {
            let mut handles = self.handles.write();
            handles.db_next = Some(Arc::clone(&db_new));
            handles.journal_next = Some(Arc::clone(&journal_new));
        }
        guard.release(MoveState::Moving);

        info!("copying blockstore");
        self.copy_store(ctx, &db_new, &journal_new)?;

        // Swap active and shadow.
        let guard = self.move_lock.lock_move();
        let (db_old, journal_old) = {
            let mut handles = self.handles.write();
            handles.db_next = None;
            handles.journal_next = None;
            let db_old = mem::replace(&mut handles.db, Arc::clone(&db_new));
            let journal_old = handles.journal.replace(Arc::clone(&journal_new));
            (db_old, journal_old)
        };
        guard.release(MoveState::Cleanup);

        // Retire the old pair; failures here cost nothing but a warning.
        if let Err(err) = db_old.close() {
            warn!(%err, "error closing old engine");
        }
        if let Some(journal_old) = journal_old
            && let Err(err) = journal_old.close()
        {
            warn!(%err, "error closing old journal");
        }
        drop(db_old);

        // Move the old directory out of the way, then point the canonical
        // path at the new store. Neither step has a safe rollback: a
        // failure leaves the canonical path attached to nothing, so abort
        // loudly rather than leave a time bomb for the next restart.
        let backup_path = PathBuf::from(format!("{}.old.{}", base_path.display(), unix_secs()));
        if let Err(err) = fs::rename(base_path, &backup_path) {
            error!(
                from = %base_path.display(),
                to = %backup_path.display(),
                %err,
                "USER ACTION REQUIRED: renaming the old store directory failed; \
                 the canonical path still points at the retired store"
            );
            panic!(
                "error renaming old store dir from {} to {}: {err}; USER ACTION REQUIRED",
                base_path.display(),
                backup_path.display(),
            );
        }
        if let Err(err) = symlink_store(&new_path, base_path) {
            error!(
                link = %base_path.display(),
                target = %new_path.display(),
                %err,
                "USER ACTION REQUIRED: symlinking the canonical path to the new store failed; \
                 the canonical path currently points at nothing"
            );
            panic!(
                "error symlinking new store dir from {} to {}: {err}; USER ACTION REQUIRED",
                new_path.display(),
                base_path.display(),
            );
        }

        delete_store_dir(&backup_path);

        info!("moving blockstore done");
        Ok(())
    }

    /// Stream every entry of the active store into the shadow pair.
    ///
    /// Every key is validated on the way through (decode + digest policy),
    /// journal records accumulate per group, and both the batch flush and
    /// the cancellation check happen at group boundaries.
    fn copy_store(&self, ctx: &CancellationToken, to: &Engine, journal: &Journal) -> Result<()> {
        let from = self.handles().db;
        let prefix_len = self.opts.prefix.len();

        let mut batch = WriteBatch::default();
        let mut journal_buf = Vec::with_capacity(COPY_GROUP_SIZE * MH_JOURNAL_RECORD_LEN);
        let mut in_group = 0usize;
        let mut copied = 0u64;

        for item in from.iter(&self.opts.prefix) {
            if in_group == COPY_GROUP_SIZE {
                if ctx.is_cancelled() {
                    return CancelledSnafu.fail();
                }
                to.write(mem::take(&mut batch))?;
                journal
                    .append(&journal_buf)
                    .context(JournalSnafu { op: "append during copy" })?;
                journal_buf.clear();
                in_group = 0;
            }

            let (raw_key, value) = item.context(BackendSnafu {
                op: "failed to stream store contents",
            })?;
            let mh = key::decode_multihash(&raw_key, prefix_len)?;
            let smh = digest::classify(&mh)?;

            batch.put(&raw_key, &value);
            // NOTE: records may duplicate ones the dual-write path already
            // appended; the journal tolerates duplicates by design.
            journal_buf.push(smh.journal_code);
            journal_buf.extend_from_slice(smh.digest);
            in_group += 1;
            copied += 1;
        }

        if ctx.is_cancelled() {
            return CancelledSnafu.fail();
        }
        to.write(batch)?;
        journal
            .append(&journal_buf)
            .context(JournalSnafu { op: "append during copy" })?;

        info!(copied, "blockstore copy complete");
        Ok(())
    }
}

/// Create a symlink at `link_at` pointing to `new_path`; the link is
/// relative when both resolve into the same directory.
fn symlink_store(new_path: &Path, link_at: &Path) -> io::Result<()> {
    let target: PathBuf = match (resolved_parent(new_path), resolved_parent(link_at)) {
        (Some(a), Some(b)) if a == b => match new_path.file_name() {
            Some(name) => PathBuf::from(name),
            None => new_path.to_path_buf(),
        },
        _ => new_path.to_path_buf(),
    };
    std::os::unix::fs::symlink(target, link_at)
}

fn resolved_parent(path: &Path) -> Option<PathBuf> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::canonicalize(parent).ok()
}

/// Best-effort recursive removal of a store directory, following a symlink
/// to the data and removing the link itself afterwards.
fn delete_store_dir(path: &Path) {
    let target = match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => match fs::canonicalize(path) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(path = %path.display(), %err, "error resolving symlinks");
                return;
            }
        },
        Ok(_) => path.to_path_buf(),
        Err(err) => {
            warn!(path = %path.display(), %err, "error inspecting store directory");
            return;
        }
    };

    info!(path = %target.display(), "removing data directory");
    if let Err(err) = fs::remove_dir_all(&target) {
        warn!(path = %target.display(), %err, "error deleting store directory");
        return;
    }

    if target != path {
        info!(path = %path.display(), "removing link");
        if let Err(err) = fs::remove_file(path) {
            warn!(%err, "error removing symbolic link");
        }
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
