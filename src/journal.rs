//! The multihash sidecar journal.
//!
//! An append-only file of fixed 33-byte records `{code: u8, digest: [u8; 32]}`
//! written in lockstep with engine mutations. It is not a transaction log: it
//! cannot restore lost blocks, it records which digests have ever been stored
//! so an offline tool can reconstruct the historical digest set after
//! value-log GC has discarded the blocks themselves. Duplicates are expected
//! and never deduplicated online.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::constants::MH_JOURNAL_FILENAME;
use crate::constants::MH_JOURNAL_RECORD_LEN;

/// Hook applied to the journal file at open time, e.g. to advise the kernel
/// about write-behind. Performance knob only; errors fail the open.
pub type FileAdvisor = fn(&File) -> io::Result<()>;

/// Append-only writer for `MultiHashes.bin`.
///
/// Appends are whole records and serialized internally, so concurrent
/// writers cannot interleave partial records.
#[derive(Debug)]
pub struct Journal {
    file: Mutex<File>,
    path: PathBuf,
}

impl Journal {
    /// Open (create if missing) the journal inside the store directory.
    pub fn open(dir: &Path, advisor: Option<FileAdvisor>) -> io::Result<Journal> {
        let path = dir.join(MH_JOURNAL_FILENAME);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o644)
            .open(&path)?;

        if let Some(advise) = advisor {
            advise(&file)?;
        }

        Ok(Journal {
            file: Mutex::new(file),
            path,
        })
    }

    /// Append a buffer of whole records.
    ///
    /// `records` must be a multiple of the record length; an empty buffer is
    /// a no-op. A short write surfaces as an I/O error.
    pub fn append(&self, records: &[u8]) -> io::Result<()> {
        debug_assert_eq!(records.len() % MH_JOURNAL_RECORD_LEN, 0);
        if records.is_empty() {
            return Ok(());
        }
        self.file.lock().write_all(records)
    }

    /// Durably flush everything appended so far.
    pub fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }

    /// Flush and release. The handle itself is released on drop.
    pub fn close(&self) -> io::Result<()> {
        self.sync()
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_whole_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = Journal::open(dir.path(), None).expect("open");

        let mut records = vec![1u8];
        records.extend_from_slice(&[0x11; 32]);
        records.push(0);
        records.extend_from_slice(&[0x22; 32]);

        journal.append(&records).expect("append");
        journal.sync().expect("sync");

        let on_disk = std::fs::read(journal.path()).expect("read back");
        assert_eq!(on_disk.len(), 2 * MH_JOURNAL_RECORD_LEN);
        assert_eq!(on_disk, records);
    }

    #[test]
    fn empty_append_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = Journal::open(dir.path(), None).expect("open");

        journal.append(&[]).expect("append");
        let on_disk = std::fs::read(journal.path()).expect("read back");
        assert!(on_disk.is_empty());
    }

    #[test]
    fn reopen_appends_after_existing_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let record = [0u8; MH_JOURNAL_RECORD_LEN];

        {
            let journal = Journal::open(dir.path(), None).expect("open");
            journal.append(&record).expect("append");
        }
        {
            let journal = Journal::open(dir.path(), None).expect("reopen");
            journal.append(&record).expect("append");
            journal.close().expect("close");
        }

        let on_disk = std::fs::read(dir.path().join(MH_JOURNAL_FILENAME)).expect("read back");
        assert_eq!(on_disk.len(), 2 * MH_JOURNAL_RECORD_LEN);
    }

    #[test]
    fn advisor_runs_at_open() {
        fn touch(_: &File) -> io::Result<()> {
            Ok(())
        }

        let dir = tempfile::tempdir().expect("tempdir");
        Journal::open(dir.path(), Some(touch)).expect("open with advisor");
    }
}
