//! Header batch validation: height contiguity, `previousHash` linkage,
//! and strictly increasing timestamps.
//!
//! A small, independently testable validator consulted by the
//! synchronizer before a header batch is accepted into the window.

use thiserror::Error;

use super::header::Header;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderBatchError {
    #[error("batch is empty")]
    Empty,
    #[error("first header height {got} does not match expected {expected}")]
    WrongStartHeight { expected: u64, got: u64 },
    #[error("header height {got} is not {expected} (prev + 1)")]
    NonSequentialHeight { expected: u64, got: u64 },
    #[error("header at height {height} has previous_hash {got} but expected {expected}")]
    BrokenLinkage { height: u64, expected: String, got: String },
    #[error("header at height {height} does not have a strictly increasing timestamp")]
    NonIncreasingTimestamp { height: u64 },
}

/// Validates one batch against `expected_start_height` and, if this isn't
/// the very first batch of the sync run, the last header already accepted.
pub fn validate_batch(
    batch: &[Header],
    expected_start_height: u64,
    prev_accepted: Option<&Header>,
) -> Result<(), HeaderBatchError> {
    let Some(first) = batch.first() else {
        return Err(HeaderBatchError::Empty);
    };

    if first.height != expected_start_height {
        return Err(HeaderBatchError::WrongStartHeight {
            expected: expected_start_height,
            got: first.height,
        });
    }

    let mut prev = prev_accepted;
    for header in batch {
        if let Some(prev_header) = prev {
            if header.height != prev_header.height + 1 {
                return Err(HeaderBatchError::NonSequentialHeight {
                    expected: prev_header.height + 1,
                    got: header.height,
                });
            }
            if header.previous_hash != prev_header.hash {
                return Err(HeaderBatchError::BrokenLinkage {
                    height: header.height,
                    expected: prev_header.hash.clone(),
                    got: header.previous_hash.clone(),
                });
            }
            if header.timestamp <= prev_header.timestamp {
                return Err(HeaderBatchError::NonIncreasingTimestamp { height: header.height });
            }
        }
        prev = Some(header);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64, hash: &str, prev: &str, ts: u64) -> Header {
        Header {
            height,
            hash: hash.to_string(),
            previous_hash: prev.to_string(),
            timestamp: ts,
        }
    }

    #[test]
    fn accepts_a_well_formed_chain() {
        let batch = vec![
            header(0, "h0", "genesis", 1),
            header(1, "h1", "h0", 2),
            header(2, "h2", "h1", 3),
        ];
        assert!(validate_batch(&batch, 0, None).is_ok());
    }

    #[test]
    fn rejects_wrong_start_height() {
        let batch = vec![header(5, "h5", "h4", 1)];
        assert_eq!(
            validate_batch(&batch, 0, None),
            Err(HeaderBatchError::WrongStartHeight { expected: 0, got: 5 })
        );
    }

    #[test]
    fn rejects_broken_previous_hash_linkage() {
        let prev = header(2499, "h2499", "h2498", 100);
        let batch = vec![header(2500, "h2500", "not-h2499", 101)];
        let result = validate_batch(&batch, 2500, Some(&prev));
        assert!(matches!(result, Err(HeaderBatchError::BrokenLinkage { height: 2500, .. })));
    }

    #[test]
    fn rejects_non_increasing_timestamp() {
        let prev = header(0, "h0", "genesis", 100);
        let batch = vec![header(1, "h1", "h0", 100)];
        assert_eq!(
            validate_batch(&batch, 1, Some(&prev)),
            Err(HeaderBatchError::NonIncreasingTimestamp { height: 1 })
        );
    }

    #[test]
    fn rejects_empty_batch() {
        assert_eq!(validate_batch(&[], 0, None), Err(HeaderBatchError::Empty));
    }
}
