//! Pure re-verification of selections.
//!
//! Nothing here performs I/O. Given a record (or just a seed, a pool
//! snapshot and a claimed witness) anyone can recompute the selection.

use subtle::ConstantTimeEq;

use super::error::VerificationError;
use super::record::{ALGORITHM_VERSION, SelectionRecord};
use super::seed::{Seed, combine, seed_index};
use crate::types::WitnessId;

/// Verifies a full selection record.
///
/// Checks, in order: the algorithm version, that the stored combined seed
/// matches its entropy and chain hash, and that the effective seed selects
/// the claimed witness from the stored snapshot.
///
/// # Errors
///
/// Returns the [`VerificationError`] describing the first discrepancy.
pub fn verify(record: &SelectionRecord) -> Result<(), VerificationError> {
    if record.algorithm_version() != ALGORITHM_VERSION {
        return Err(VerificationError::UnsupportedAlgorithm {
            version: record.algorithm_version().to_string(),
        });
    }
    let seed = record.seed();
    let recomputed = combine(seed.external_entropy(), seed.chain_hash());
    if !bool::from(recomputed[..].ct_eq(&seed.combined_seed()[..])) {
        return Err(VerificationError::SeedTampered);
    }
    verify_claim(
        &record.effective_seed(),
        record.pool_snapshot(),
        record.selected_witness_id(),
    )
}

/// Verifies that `seed` selects `claimed` from `pool_snapshot`.
///
/// `seed` is the effective seed: the combined seed for a first-candidate
/// selection, or the retry seed for the accepted attempt.
///
/// # Errors
///
/// Returns [`VerificationError::EmptyPool`] or
/// [`VerificationError::UnsortedSnapshot`] for an invalid snapshot, and
/// [`VerificationError::Mismatch`] naming both witnesses when the claim is
/// wrong.
pub fn verify_claim(
    seed: &Seed,
    pool_snapshot: &[WitnessId],
    claimed: &WitnessId,
) -> Result<(), VerificationError> {
    let expected = expected_witness(seed, pool_snapshot)?;
    if expected != claimed {
        return Err(VerificationError::Mismatch {
            expected: expected.clone(),
            claimed: claimed.clone(),
        });
    }
    Ok(())
}

/// Returns the witness `seed` selects from `pool_snapshot`.
///
/// # Errors
///
/// Returns [`VerificationError::EmptyPool`] or
/// [`VerificationError::UnsortedSnapshot`] for an invalid snapshot.
pub fn expected_witness<'a>(
    seed: &Seed,
    pool_snapshot: &'a [WitnessId],
) -> Result<&'a WitnessId, VerificationError> {
    if let Some(position) = pool_snapshot
        .windows(2)
        .position(|pair| pair[0] >= pair[1])
    {
        return Err(VerificationError::UnsortedSnapshot {
            position: position + 1,
        });
    }
    let index = seed_index(seed, pool_snapshot.len()).ok_or(VerificationError::EmptyPool)?;
    pool_snapshot.get(index).ok_or(VerificationError::EmptyPool)
}
