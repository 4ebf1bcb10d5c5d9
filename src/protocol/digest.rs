//! Payload digests
//!
//! SHA-256 over the full logical payload, used to detect corrupted or
//! mismatched reassembly.

use sha2::{Digest as Sha2Digest, Sha256};

/// SHA-256 digest
pub type Digest = [u8; 32];

/// Compute the SHA-256 digest of a byte slice
pub fn digest(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Compute the digest of several slices as if they were concatenated
pub fn digest_parts<'a, I>(parts: I) -> Digest
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
