//! Integrity digests for sync payloads
//!
//! Two digests with different jobs:
//!
//! - [`strong_digest`] is SHA-256 over a whole serialized snapshot, computed
//!   once per envelope.
//! - [`fast_digest`] is a 32-bit polynomial hash over a single fragment. It
//!   catches scan and transcription errors; it is not collision resistant.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of a [`fast_digest`] string
pub const FAST_DIGEST_LEN: usize = 8;

/// Compute the SHA-256 digest of `bytes` as lowercase hex
pub fn strong_digest(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Compute the cheap per-fragment digest of `text`
///
/// `h = h * 31 + unit` over UTF-16 code units with wrapping 32-bit
/// arithmetic, rendered as 8 lowercase hex characters.
pub fn fast_digest(text: &str) -> String {
    let hash = text
        .encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(u32::from(unit)));
    format!("{:08x}", hash)
}

/// Check `bytes` against an expected strong digest
pub fn verify_strong(bytes: impl AsRef<[u8]>, expected: &str) -> Result<()> {
    let actual = strong_digest(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Check fragment `data` against its fast digest
pub fn verify_fast(index: usize, data: &str, expected: &str) -> Result<()> {
    if fast_digest(data).eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::FragmentCorrupted { index })
    }
}
