//! Shared helpers for blockstore integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::path::Path;

use cairn::Blockstore;
use cairn::Options;
use cid::Cid;
use multihash_codetable::Code;
use multihash_codetable::MultihashDigest;

/// Multicodec code for raw block payloads.
pub const RAW: u64 = 0x55;

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cairn=info")
        .try_init();
}

/// Open a store with test-sized buffers at `path`.
pub fn open_store(path: &Path) -> Blockstore {
    Blockstore::open(Options::for_testing(path)).expect("open blockstore")
}

/// A raw-codec cid over the SHA2-256 digest of `data`.
pub fn sha2_cid(data: &[u8]) -> Cid {
    Cid::new_v1(RAW, Code::Sha2_256.digest(data))
}

/// A raw-codec cid over the BLAKE2b-256 digest of `data`.
pub fn blake2b_cid(data: &[u8]) -> Cid {
    Cid::new_v1(RAW, Code::Blake2b256.digest(data))
}

/// A deterministic unique block for writer `writer` at index `i`.
pub fn numbered_block(writer: usize, i: usize, value_len: usize) -> (Cid, Vec<u8>) {
    let seed = format!("writer {writer} block {i}");
    let mut data = seed.into_bytes();
    data.resize(value_len.max(data.len()), (writer as u8) ^ (i as u8));
    (sha2_cid(&data), data)
}

/// Bytes of the journal file inside (a possibly symlinked) `dir`.
pub fn journal_bytes(dir: &Path) -> Vec<u8> {
    std::fs::read(dir.join(cairn::constants::MH_JOURNAL_FILENAME)).expect("read journal")
}
