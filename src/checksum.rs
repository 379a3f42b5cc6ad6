//! Primary (CRC32C) and backup (SHA-256) digests over a chunk's decompressed
//! bytes, used by [`crate::integrity::IntegrityValidator`].

use sha2::{Digest, Sha256};

pub type Sha256Digest = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumPair {
    pub primary: u32,
    pub backup: Sha256Digest,
}

pub fn compute(bytes: &[u8]) -> ChecksumPair {
    let primary = crc32c::crc32c(bytes);
    let backup: Sha256Digest = Sha256::digest(bytes).into();
    ChecksumPair { primary, backup }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_checksum() {
        let data = b"probability tunnel";
        assert_eq!(compute(data), compute(data));
    }

    #[test]
    fn different_bytes_different_primary() {
        let a = compute(b"aaaa");
        let b = compute(b"aaab");
        assert_ne!(a.primary, b.primary);
    }
}
