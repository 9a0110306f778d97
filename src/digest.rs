//! Digest policy: the closed table of multihash families the store accepts.
//!
//! The table is authoritative; growing it is a data migration (journal codes
//! must stay stable forever, see [`crate::journal`]), so additions are a
//! deliberate act, not a configuration knob.

use crate::constants::SUPPORTED_HASH_LEN;
use crate::error::Result;
use crate::error::UnsupportedDigestSnafu;

/// The multihash width used across the crate.
pub type Multihash = multihash::Multihash<64>;

/// Multihash type code for SHA2-256.
pub const SHA2_256: u64 = 0x12;

/// Multihash type code for BLAKE2b-256.
pub const BLAKE2B_256: u64 = 0xb220;

/// A multihash that passed the policy check.
///
/// Carries the dense one-byte journal code for its family and a borrow of
/// the raw 256-bit digest.
#[derive(Debug, Clone, Copy)]
pub struct SupportedDigest<'a> {
    /// Dense journal code identifying the multihash family.
    ///
    /// One byte instead of the multi-byte wire prefix; at tens of billions
    /// of journal records the difference is measured in gigabytes.
    pub journal_code: u8,
    /// The raw digest bytes, exactly [`SUPPORTED_HASH_LEN`] of them.
    pub digest: &'a [u8],
}

/// Check a multihash against the supported table.
///
/// Returns the journal code and raw digest on success,
/// [`BlockstoreError::UnsupportedDigest`] when the family is unknown or the
/// digest is not 256 bits wide.
pub fn classify(mh: &Multihash) -> Result<SupportedDigest<'_>> {
    let code = mh.code();
    let size = mh.size();

    if usize::from(size) != SUPPORTED_HASH_LEN {
        return UnsupportedDigestSnafu { code, size }.fail();
    }

    let journal_code = match code {
        SHA2_256 => 0,
        BLAKE2B_256 => 1,
        _ => return UnsupportedDigestSnafu { code, size }.fail(),
    };

    Ok(SupportedDigest {
        journal_code,
        digest: mh.digest(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockstoreError;

    fn wrap(code: u64, digest: &[u8]) -> Multihash {
        Multihash::wrap(code, digest).expect("digest fits")
    }

    #[test]
    fn classifies_sha2_256() {
        let mh = wrap(SHA2_256, &[0x11; 32]);
        let smh = classify(&mh).expect("supported");
        assert_eq!(smh.journal_code, 0);
        assert_eq!(smh.digest, &[0x11; 32]);
    }

    #[test]
    fn classifies_blake2b_256() {
        let mh = wrap(BLAKE2B_256, &[0x22; 32]);
        let smh = classify(&mh).expect("supported");
        assert_eq!(smh.journal_code, 1);
        assert_eq!(smh.digest, &[0x22; 32]);
    }

    #[test]
    fn rejects_unknown_family() {
        // SHA3-256 is deliberately absent from the table.
        let mh = wrap(0x16, &[0x33; 32]);
        let err = classify(&mh).expect_err("unsupported");
        assert!(matches!(err, BlockstoreError::UnsupportedDigest { code: 0x16, size: 32 }));
    }

    #[test]
    fn rejects_wrong_width() {
        let mh = wrap(SHA2_256, &[0x44; 16]);
        let err = classify(&mh).expect_err("wrong width");
        assert!(matches!(err, BlockstoreError::UnsupportedDigest { size: 16, .. }));
    }
}
