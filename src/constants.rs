//! Fixed limits and policy defaults for the block store.
//!
//! All constants are explicitly typed with fixed bounds; the journal record
//! geometry in particular is load-bearing and must never change (see
//! [`crate::journal`]).

use std::time::Duration;

/// Multicodec code for raw (uninterpreted) block payloads.
pub const RAW_CODEC: u64 = 0x55;

/// The only digest width the store accepts (256 bits).
///
/// The journal record size and the key-buffer pool sizing are derived from
/// this, so it is hard-wired rather than configurable.
pub const SUPPORTED_HASH_LEN: usize = 32;

/// File name of the multihash sidecar journal inside the store directory.
pub const MH_JOURNAL_FILENAME: &str = "MultiHashes.bin";

/// Size of one journal record: a one-byte digest-family code plus the raw
/// 256-bit digest.
pub const MH_JOURNAL_RECORD_LEN: usize = 1 + SUPPORTED_HASH_LEN;

/// Default stale-data threshold for value-log garbage collection.
///
/// Passed to the engine when [`crate::GcOptions`] leaves the threshold unset.
pub const DEFAULT_GC_THRESHOLD: f64 = 0.125;

/// Minimum interval between health-check invocations during online GC.
///
/// Checking more frequently than this is pointless and is clamped away.
pub const MIN_GC_CHECK_FREQ: Duration = Duration::from_secs(30);

/// Number of key/value pairs copied per group during a move.
///
/// Cancellation is observed and the shadow write batch is flushed at every
/// group boundary, so this bounds both cancel latency and batch memory.
pub const COPY_GROUP_SIZE: usize = 1024;

/// Upper bound on idle key buffers retained by a store's key pool.
pub const KEY_POOL_MAX_IDLE: usize = 64;

/// Bound of the channel returned by [`crate::Blockstore::keys_channel`].
pub const KEYS_CHANNEL_DEPTH: usize = 100;
