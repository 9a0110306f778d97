//! The block store: a content-addressed map from cids to immutable bytes,
//! durably backed by the embedded LSM engine and the multihash journal.
//!
//! Every public operation is bracketed by lifecycle admission (see
//! [`crate::gate`]) and a shared acquisition of the move lock (see
//! [`crate::movelock`]). Engine and journal handles live behind a read-write
//! lock of `Arc`s: operations clone the `Arc`s under the read half, and the
//! mover swaps them under the write half while it holds the move lock
//! exclusively, so a handle observed by an admitted operation stays valid
//! for the whole call even when a relocation commits mid-flight.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use bytes::Bytes;
use cid::Cid;
use parking_lot::RwLock;
use rocksdb::WriteBatch;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::constants::KEYS_CHANNEL_DEPTH;
use crate::constants::MH_JOURNAL_RECORD_LEN;
use crate::constants::RAW_CODEC;
use crate::digest;
use crate::engine::Engine;
use crate::error::BackendSnafu;
use crate::error::BlockstoreError;
use crate::error::ClosedSnafu;
use crate::error::IoSnafu;
use crate::error::JournalSnafu;
use crate::error::NotFoundSnafu;
use crate::error::ReadOnlySnafu;
use crate::error::Result;
use crate::gate::AccessGuard;
use crate::gate::LifecycleGate;
use crate::journal::Journal;
use crate::key;
use crate::key::KeyPool;
use crate::key::PooledKey;
use crate::movelock::MoveLock;
use crate::options::Options;

/// An immutable `(cid, bytes)` pair returned by [`Blockstore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The content identifier the block was stored under.
    pub cid: Cid,
    /// The block payload. Not re-hashed on read; values are trusted.
    pub data: Bytes,
}

/// The engine and journal handles, including the shadow pair while a move
/// is under way.
#[derive(Debug, Clone)]
pub(crate) struct Handles {
    pub(crate) db: Arc<Engine>,
    pub(crate) journal: Option<Arc<Journal>>,
    pub(crate) db_next: Option<Arc<Engine>>,
    pub(crate) journal_next: Option<Arc<Journal>>,
}

/// A content-addressed block store over an embedded LSM engine.
///
/// Safe to share across threads; all operations take `&self`.
#[derive(Debug)]
pub struct Blockstore {
    pub(crate) gate: Arc<LifecycleGate>,
    pub(crate) move_lock: MoveLock,
    pub(crate) handles: RwLock<Handles>,
    pub(crate) key_pool: KeyPool,
    pub(crate) opts: Options,
}

impl Blockstore {
    /// Open (creating if absent) a block store with the supplied options.
    pub fn open(opts: Options) -> Result<Blockstore> {
        let db = Arc::new(Engine::open(&opts, &opts.path, opts.read_only)?);
        let journal = if opts.read_only {
            None
        } else {
            Some(Arc::new(
                Journal::open(&opts.path, opts.journal_advisor).context(JournalSnafu { op: "open" })?,
            ))
        };

        info!(path = %opts.path.display(), read_only = opts.read_only, "blockstore opened");

        Ok(Blockstore {
            gate: LifecycleGate::new(),
            move_lock: MoveLock::new(),
            handles: RwLock::new(Handles {
                db,
                journal,
                db_next: None,
                journal_next: None,
            }),
            key_pool: KeyPool::new(),
            opts,
        })
    }

    pub(crate) fn admit(&self) -> Result<AccessGuard> {
        LifecycleGate::admit(&self.gate)
    }

    pub(crate) fn handles(&self) -> Handles {
        self.handles.read().clone()
    }

    pub(crate) fn storage_key(&self, cid: &Cid) -> PooledKey<'_> {
        key::pooled_key(&self.key_pool, &self.opts.prefix, cid)
    }

    /// Whether a block is stored under `cid`.
    pub fn has(&self, cid: &Cid) -> Result<bool> {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();
        let handles = self.handles();

        let key = self.storage_key(cid);
        Ok(handles.db.get_pinned(&key)?.is_some())
    }

    /// Invoke `f` with a borrowed view of the block stored under `cid`.
    ///
    /// Zero-copy: the slice is only valid for the duration of `f`. Fails
    /// with `NotFound` when the block is absent.
    pub fn view<T>(&self, cid: &Cid, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();
        let handles = self.handles();

        let key = self.storage_key(cid);
        match handles.db.get_pinned(&key)? {
            Some(value) => Ok(f(&value)),
            None => NotFoundSnafu { cid: *cid }.fail(),
        }
    }

    /// Fetch the block stored under `cid`, copying the payload out.
    pub fn get(&self, cid: &Cid) -> Result<Block> {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();
        let handles = self.handles();

        let key = self.storage_key(cid);
        match handles.db.get_pinned(&key)? {
            Some(value) => Ok(Block {
                cid: *cid,
                data: Bytes::copy_from_slice(&value),
            }),
            None => NotFoundSnafu { cid: *cid }.fail(),
        }
    }

    /// Size in bytes of the block stored under `cid`.
    pub fn get_size(&self, cid: &Cid) -> Result<usize> {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();
        let handles = self.handles();

        let key = self.storage_key(cid);
        match handles.db.get_pinned(&key)? {
            Some(value) => Ok(value.len()),
            None => NotFoundSnafu { cid: *cid }.fail(),
        }
    }

    /// Store a single block.
    pub fn put(&self, cid: &Cid, data: impl AsRef<[u8]>) -> Result<()> {
        self.put_many(&[(*cid, data)])
    }

    /// Store a batch of blocks.
    ///
    /// Already-present blocks are skipped entirely: no overwrite churn in
    /// the engine and no duplicate journal record. A single unsupported
    /// multihash fails the whole batch before anything is written. While a
    /// move is under way the batch and its journal records are applied to
    /// both the active and the shadow store.
    pub fn put_many<B: AsRef<[u8]>>(&self, blocks: &[(Cid, B)]) -> Result<()> {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();
        let handles = self.handles();
        let Some(journal) = handles.journal.as_ref() else {
            return ReadOnlySnafu.fail();
        };

        // The pooled keys must outlive the engine calls below; the engine
        // copies keys, so the pool gets them back when `keys` drops.
        let keys: Vec<PooledKey<'_>> = blocks.iter().map(|(cid, _)| self.storage_key(cid)).collect();

        let mut present = vec![false; blocks.len()];
        let mut journal_buf = Vec::with_capacity(blocks.len() * MH_JOURNAL_RECORD_LEN);

        for (i, (cid, _)) in blocks.iter().enumerate() {
            if handles.db.get_pinned(&keys[i])?.is_some() {
                present[i] = true;
                continue;
            }
            let smh = digest::classify(cid.hash())?;
            journal_buf.push(smh.journal_code);
            journal_buf.extend_from_slice(smh.digest);
        }

        let write_to = |db: &Engine, journal: &Journal| -> Result<()> {
            let mut batch = WriteBatch::default();
            for (i, (_, data)) in blocks.iter().enumerate() {
                if present[i] {
                    continue;
                }
                batch.put(&keys[i], data.as_ref());
            }
            db.write(batch)?;

            // Journal strictly after the batch: a crash in between leaves a
            // journal gap, never a journal record without its block.
            journal.append(&journal_buf).context(JournalSnafu { op: "append" })
        };

        write_to(&handles.db, journal)?;
        if let (Some(db_next), Some(journal_next)) = (&handles.db_next, &handles.journal_next) {
            write_to(db_next, journal_next)?;
        }
        Ok(())
    }

    /// Delete a single block.
    pub fn delete(&self, cid: &Cid) -> Result<()> {
        self.delete_many(std::slice::from_ref(cid))
    }

    /// Delete a batch of blocks.
    ///
    /// The journal is deliberately left alone: it records digests that have
    /// ever been stored, not the current contents.
    pub fn delete_many(&self, cids: &[Cid]) -> Result<()> {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();
        let handles = self.handles();
        if self.opts.read_only {
            return ReadOnlySnafu.fail();
        }

        let keys: Vec<PooledKey<'_>> = cids.iter().map(|cid| self.storage_key(cid)).collect();
        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete(key);
        }
        handles.db.write(batch)
    }

    /// Synchronously visit the cid of every stored block.
    ///
    /// Aborts with `Closed` if shutdown begins mid-iteration, and with the
    /// visitor's error if it returns one.
    pub fn for_each_key<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Cid) -> Result<()>,
    {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();
        let handles = self.handles();

        let prefix_len = self.opts.prefix.len();
        for item in handles.db.iter(&self.opts.prefix) {
            if !self.gate.is_open() {
                return ClosedSnafu.fail();
            }
            let (raw_key, _) = item.context(BackendSnafu {
                op: "failed to iterate keys",
            })?;
            let mh = key::decode_multihash(&raw_key, prefix_len)?;
            f(Cid::new_v1(RAW_CODEC, mh))?;
        }
        Ok(())
    }

    /// Lazily stream the cid of every stored block.
    ///
    /// The producer holds an admission for the lifetime of the channel and
    /// stops at the first of: cancellation, store shutdown, or the receiver
    /// going away. Undecodable keys are logged and skipped rather than
    /// terminating the stream.
    pub fn keys_channel(&self, ctx: CancellationToken) -> Result<mpsc::Receiver<Cid>> {
        let access = self.admit()?;
        let db = {
            let _db_lock = self.move_lock.lock_db();
            self.handles().db
        };
        let gate = Arc::clone(&self.gate);
        let prefix = self.opts.prefix.clone();
        let (tx, rx) = mpsc::sync_channel(KEYS_CHANNEL_DEPTH);

        thread::spawn(move || {
            let _access = access;
            for item in db.iter(&prefix) {
                if ctx.is_cancelled() || !gate.is_open() {
                    return;
                }
                let raw_key = match item {
                    Ok((raw_key, _)) => raw_key,
                    Err(err) => {
                        warn!(%err, "key iteration failed");
                        return;
                    }
                };
                match key::decode_multihash(&raw_key, prefix.len()) {
                    Ok(mh) => {
                        if tx.send(Cid::new_v1(RAW_CODEC, mh)).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(%err, "skipping undecodable key"),
                }
            }
        });

        Ok(rx)
    }

    /// Durably persist everything acknowledged so far: the shadow pair
    /// first when a move is under way, then the active journal and engine.
    ///
    /// All four syncs are attempted; the first failure is returned.
    pub fn flush(&self) -> Result<()> {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();
        if self.opts.read_only {
            return Ok(());
        }
        let handles = self.handles();

        let mut first_err: Option<BlockstoreError> = None;
        let mut note = |result: Result<()>| {
            if let Err(err) = result {
                warn!(%err, "flush failure");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        };

        if let (Some(db_next), Some(journal_next)) = (&handles.db_next, &handles.journal_next) {
            note(db_next.sync_wal());
            note(journal_next.sync().context(JournalSnafu { op: "sync" }));
        }
        if let Some(journal) = &handles.journal {
            note(journal.sync().context(JournalSnafu { op: "sync" }));
        }
        note(handles.db.sync_wal());

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Aggregate on-disk size of the store directory.
    ///
    /// Sums directory entries rather than asking the engine: the journal
    /// lives outside the engine's accounting, and the directory may be
    /// reached through a symlink the engine reports as zero-sized.
    pub fn size(&self) -> Result<u64> {
        let _access = self.admit()?;
        let _db_lock = self.move_lock.lock_db();

        let dir = &self.opts.path;
        let entries = std::fs::read_dir(dir).context(IoSnafu {
            op: "failed to scan store directory",
            path: dir.clone(),
        })?;

        let mut total = 0u64;
        for entry in entries {
            let entry = entry.context(IoSnafu {
                op: "failed to scan store directory",
                path: dir.clone(),
            })?;
            // A compaction may remove a file between listing and stat.
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Close the store: stop admitting, drain in-flight operations, then
    /// release the engine and the journal.
    ///
    /// Both are always released; the first error is returned and the rest
    /// logged. A second close is a successful no-op.
    pub fn close(&self) -> Result<()> {
        if !self.gate.begin_close() {
            return Ok(());
        }
        self.gate.wait_idle();

        let handles = self.handles();
        let mut first_err: Option<BlockstoreError> = None;

        if let Err(err) = handles.db.close() {
            warn!(%err, "failure closing the engine");
            first_err = Some(err);
        }
        if let Some(journal) = &handles.journal
            && let Err(err) = journal.close().context(JournalSnafu { op: "close" })
        {
            warn!(%err, "failure closing the multihash journal");
            if first_err.is_none() {
                first_err = Some(err);
            }
        }

        self.gate.finish_close();
        info!(path = %self.opts.path.display(), "blockstore closed");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The options the store was opened with.
    pub fn options(&self) -> &Options {
        &self.opts
    }
}
