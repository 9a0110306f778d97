//! Storage-key codec and the pooled key buffers behind it.
//!
//! A storage key is `prefix || base32_no_padding(multihash)`. The base32
//! flavor is raw-standard (RFC 4648 alphabet, no padding), so
//! `decode(encode(k))` is the identity on every supported multihash.
//!
//! Key buffers come from a per-store [`KeyPool`]; [`PooledKey`] is an RAII
//! guard, so a pooled buffer finds its way back to the pool on every exit
//! path, error paths included. The engine copies keys internally, which is
//! why dropping the guard right after the engine call is safe.

use cid::Cid;
use data_encoding::BASE32_NOPAD;
use parking_lot::Mutex;

use crate::constants::KEY_POOL_MAX_IDLE;
use crate::digest::Multihash;
use crate::error::Result;
use crate::error::UndecodableKeySnafu;

/// Longest multihash wire encoding the decoder will accept: a three-byte
/// type varint, a length byte, and the 256-bit digest, with headroom.
const MAX_MULTIHASH_LEN: usize = 64;

/// A small free-list of key buffers.
///
/// Storage keys are computed for every operation on every block; recycling
/// the buffers keeps the hot paths allocation-free.
#[derive(Debug, Default)]
pub struct KeyPool {
    idle: Mutex<Vec<Vec<u8>>>,
}

impl KeyPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, len: usize) -> Vec<u8> {
        let mut buf = self.idle.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    fn put(&self, buf: Vec<u8>) {
        let mut idle = self.idle.lock();
        if idle.len() < KEY_POOL_MAX_IDLE {
            idle.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A storage key borrowed from a [`KeyPool`].
///
/// Dereferences to the key bytes; returns its buffer to the pool on drop.
pub struct PooledKey<'a> {
    pool: &'a KeyPool,
    buf: Vec<u8>,
}

impl std::ops::Deref for PooledKey<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for PooledKey<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledKey<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

/// Compute the storage key for `cid` into a buffer borrowed from `pool`.
pub fn pooled_key<'a>(pool: &'a KeyPool, prefix: &[u8], cid: &Cid) -> PooledKey<'a> {
    let hash = cid.hash().to_bytes();
    let mut buf = pool.get(prefix.len() + BASE32_NOPAD.encode_len(hash.len()));
    buf[..prefix.len()].copy_from_slice(prefix);
    BASE32_NOPAD.encode_mut(&hash, &mut buf[prefix.len()..]);
    PooledKey { pool, buf }
}

/// Compute the storage key for `cid` into `dst`, growing it as needed.
///
/// The in-place sibling of [`pooled_key`] for callers that manage their own
/// buffer across many keys.
pub fn storage_key_into(dst: &mut Vec<u8>, prefix: &[u8], cid: &Cid) {
    let hash = cid.hash().to_bytes();
    dst.clear();
    dst.resize(prefix.len() + BASE32_NOPAD.encode_len(hash.len()), 0);
    dst[..prefix.len()].copy_from_slice(prefix);
    BASE32_NOPAD.encode_mut(&hash, &mut dst[prefix.len()..]);
}

/// Recover the multihash from a raw storage key.
///
/// The first `prefix_len` bytes are the store's namespace and are skipped
/// without inspection. Fails with [`UndecodableKey`] when the suffix is not
/// valid base32 or does not parse as a multihash; the caller is expected to
/// run the result through [`crate::digest::classify`].
///
/// [`UndecodableKey`]: crate::BlockstoreError::UndecodableKey
pub fn decode_multihash(key: &[u8], prefix_len: usize) -> Result<Multihash> {
    let suffix = key.get(prefix_len..).unwrap_or_default();
    let undecodable = || UndecodableKeySnafu { key: suffix.to_vec() };

    let decoded_len = BASE32_NOPAD
        .decode_len(suffix.len())
        .map_err(|_| undecodable().build())?;
    if suffix.is_empty() || decoded_len > MAX_MULTIHASH_LEN {
        return undecodable().fail();
    }

    let mut scratch = [0u8; MAX_MULTIHASH_LEN];
    let n = BASE32_NOPAD
        .decode_mut(suffix, &mut scratch[..decoded_len])
        .map_err(|_| undecodable().build())?;

    Multihash::from_bytes(&scratch[..n]).map_err(|_| undecodable().build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RAW_CODEC;
    use crate::digest;

    fn test_cid(fill: u8) -> Cid {
        let mh = Multihash::wrap(digest::SHA2_256, &[fill; 32]).expect("digest fits");
        Cid::new_v1(RAW_CODEC, mh)
    }

    #[test]
    fn round_trips_without_prefix() {
        let pool = KeyPool::new();
        let cid = test_cid(0xAB);

        let key = pooled_key(&pool, b"", &cid);
        let mh = decode_multihash(&key, 0).expect("decodes");
        assert_eq!(&mh, cid.hash());
    }

    #[test]
    fn round_trips_with_prefix() {
        let pool = KeyPool::new();
        let cid = test_cid(0xCD);

        let key = pooled_key(&pool, b"ns/", &cid);
        assert!(key.starts_with(b"ns/"));

        let mh = decode_multihash(&key, 3).expect("decodes");
        assert_eq!(&mh, cid.hash());
    }

    #[test]
    fn in_place_key_matches_pooled_key() {
        let pool = KeyPool::new();
        let cid = test_cid(0x01);

        let pooled = pooled_key(&pool, b"p", &cid);
        let mut dst = Vec::new();
        storage_key_into(&mut dst, b"p", &cid);
        assert_eq!(&*pooled, &dst[..]);
    }

    #[test]
    fn buffers_return_to_the_pool() {
        let pool = KeyPool::new();
        let cid = test_cid(0x02);

        assert_eq!(pool.idle_count(), 0);
        drop(pooled_key(&pool, b"", &cid));
        assert_eq!(pool.idle_count(), 1);
        drop(pooled_key(&pool, b"", &cid));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn rejects_garbage_suffix() {
        let err = decode_multihash(b"ns/!!not-base32!!", 3).expect_err("garbage");
        assert!(matches!(err, crate::BlockstoreError::UndecodableKey { .. }));
    }

    #[test]
    fn rejects_empty_suffix() {
        assert!(decode_multihash(b"ns/", 3).is_err());
        assert!(decode_multihash(b"", 0).is_err());
    }
}
