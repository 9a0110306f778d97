//! Content-addressed block store over an embedded LSM key-value engine.
//!
//! `cairn` stores immutable binary blocks keyed by their cid and is built to
//! be the durable substrate of an append-heavy system whose working set
//! grows to tens of billions of blocks. Key features:
//!
//! - **Content-addressed**: blocks are keyed by their multihash, encoded as
//!   `prefix || base32_no_padding(multihash)` in the engine
//! - **Multihash journal**: a crash-tolerant append-only sidecar records
//!   every digest ever stored, surviving value-log compaction of the blocks
//!   themselves
//! - **Live relocation**: the moving GC rewrites the whole store into a
//!   fresh sibling directory while reads and writes continue, then swings
//!   the canonical path over atomically
//! - **Online GC**: flatten plus value-log rewriting until the engine has
//!   nothing left to reclaim
//!
//! ## Architecture
//!
//! ```text
//! Blockstore (has / get / view / put_many / delete_many / iterate)
//!     |
//!     +--> LifecycleGate   admission + shutdown draining
//!     +--> MoveLock        shared ops vs. exclusive move transitions
//!     |
//!     +--> Engine (LSM)    keys + block payloads (value-separated)
//!     +--> Journal         MultiHashes.bin, 33-byte records
//!     |
//!     +--> shadow Engine + Journal while a move is under way
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use cairn::{Blockstore, GcOptions, Options};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Blockstore::open(Options::new("/var/lib/cairn"))?;
//!
//! store.put(&cid, b"block bytes")?;
//! let block = store.get(&cid)?;
//!
//! // Rewrite the whole store into a fresh directory, live.
//! store.collect_garbage(&CancellationToken::new(), GcOptions::full())?;
//!
//! store.close()?;
//! ```

#![warn(missing_docs)]

pub mod constants;
pub mod digest;
mod engine;
mod error;
mod gate;
mod gc;
pub mod journal;
pub mod key;
mod movelock;
mod options;
mod store;

pub use error::BlockstoreError;
pub use error::Result;
pub use gc::GcOptions;
pub use gc::HealthCheck;
pub use journal::FileAdvisor;
pub use options::Options;
pub use store::Block;
pub use store::Blockstore;
