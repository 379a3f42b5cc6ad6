//! Per-region checksum tracking and corruption detection (spec §4.7).

use std::time::Duration;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::checksum::{compute, ChecksumPair};
use crate::coord::{chunk_index, CHUNKS_PER_REGION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReport {
    /// No prior checksum was recorded; one was just computed and stored.
    ValidFirstSeen,
    Valid,
    /// Primary mismatched but the backup digest matches: recoverable.
    Repairable,
    /// Neither digest matches after retries.
    Corrupted,
}

pub struct IntegrityValidator {
    table: RwLock<Box<[Option<ChecksumPair>; CHUNKS_PER_REGION]>>,
    retries: u32,
    retries_speculative: u32,
    backoff: Duration,
}

impl IntegrityValidator {
    pub fn new(retries: u32, retries_speculative: u32, backoff: Duration) -> Self {
        Self {
            table: RwLock::new(Box::new([None; CHUNKS_PER_REGION])),
            retries,
            retries_speculative,
            backoff,
        }
    }

    /// Validate `bytes` against the stored checksum for `(cx, cz)`. On a
    /// primary mismatch, calls `reread` up to the configured retry budget,
    /// waiting `backoff * attempt` between tries, filtering transient torn
    /// reads raced against a concurrent flush.
    pub fn validate_with(
        &self,
        cx: i32,
        cz: i32,
        speculative: bool,
        mut bytes: Vec<u8>,
        mut reread: impl FnMut() -> Vec<u8>,
    ) -> ValidationReport {
        let idx = chunk_index(cx, cz);

        let existing = self.table.read()[idx];
        let Some(stored) = existing else {
            let pair = compute(&bytes);
            self.table.write()[idx] = Some(pair);
            return ValidationReport::ValidFirstSeen;
        };

        let max_retries = if speculative {
            self.retries_speculative
        } else {
            self.retries
        };

        let mut attempt = 0u32;
        loop {
            if crc32c::crc32c(&bytes) == stored.primary {
                return ValidationReport::Valid;
            }
            attempt += 1;
            if attempt > max_retries {
                break;
            }
            std::thread::sleep(self.backoff * attempt);
            bytes = reread();
        }

        let sha: [u8; 32] = Sha256::digest(&bytes).into();
        if sha == stored.backup {
            ValidationReport::Repairable
        } else {
            ValidationReport::Corrupted
        }
    }

    /// Convenience form for callers with no re-read source (e.g. tests, or
    /// an mmap slice that cannot change mid-call).
    pub fn validate(&self, cx: i32, cz: i32, bytes: &[u8], speculative: bool) -> ValidationReport {
        let owned = bytes.to_vec();
        self.validate_with(cx, cz, speculative, owned.clone(), move || owned.clone())
    }

    pub fn update_checksum(&self, cx: i32, cz: i32, bytes: &[u8]) {
        let idx = chunk_index(cx, cz);
        self.table.write()[idx] = Some(compute(bytes));
    }

    pub fn forget(&self, cx: i32, cz: i32) {
        let idx = chunk_index(cx, cz);
        self.table.write()[idx] = None;
    }
}

impl Default for IntegrityValidator {
    fn default() -> Self {
        Self::new(2, 3, Duration::from_millis(50))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_then_valid() {
        let validator = IntegrityValidator::default();
        let data = vec![7u8; 1024];
        assert_eq!(
            validator.validate(0, 0, &data, false),
            ValidationReport::ValidFirstSeen
        );
        assert_eq!(validator.validate(0, 0, &data, false), ValidationReport::Valid);
    }

    #[test]
    fn mismatch_with_matching_backup_is_repairable() {
        let validator = IntegrityValidator::default();
        let good = vec![1u8; 256];
        validator.update_checksum(5, 5, &good);

        // primary mismatches every reread, but the final reread returns the
        // original bytes so backup matches.
        let mut calls = 0;
        let report = validator.validate_with(5, 5, false, vec![2u8; 256], || {
            calls += 1;
            good.clone()
        });
        assert_eq!(report, ValidationReport::Repairable);
        assert!(calls >= 1);
    }

    #[test]
    fn persistent_mismatch_is_corrupted() {
        let validator = IntegrityValidator::default();
        let good = vec![1u8; 256];
        validator.update_checksum(5, 5, &good);

        let report = validator.validate_with(5, 5, false, vec![2u8; 256], || vec![3u8; 256]);
        assert_eq!(report, ValidationReport::Corrupted);
    }
}
