//! Content fingerprints.
//!
//! Files are identified by the SHA-256 of their bytes, rendered as 64
//! lowercase hex characters. Manifests written by older releases carry
//! 40-character SHA-1 digests; those still validate so they can be compared
//! (and will simply differ, triggering one re-index).

use sha2::{Digest, Sha256};

pub const DIGEST_HEX_LEN: usize = 64;
const LEGACY_SHA1_HEX_LEN: usize = 40;

/// Hash file content.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `true` if `digest` looks like something [`hash_bytes`] (or a legacy
/// SHA-1 manifest) produced.
pub fn is_valid_digest(digest: &str) -> bool {
    (digest.len() == DIGEST_HEX_LEN || digest.len() == LEGACY_SHA1_HEX_LEN)
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
