//! The immutable outcome of a selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::VerificationError;
use super::seed::{Seed, SelectionSeed};
use crate::canonical::{self, CanonicalError};
use crate::types::WitnessId;

/// Identifier of the seed-to-index algorithm implemented by this crate.
pub const ALGORITHM_VERSION: &str = "sha256-be64-mod/v1";

/// Everything needed to recompute a selection.
///
/// Records are never modified after [`crate::selection::WitnessSelector`]
/// builds them. Third parties check them with [`SelectionRecord::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    seed: SelectionSeed,
    seed_source: String,
    selected_witness_id: WitnessId,
    pool_snapshot: Vec<WitnessId>,
    algorithm_version: String,
    selected_at: DateTime<Utc>,
    retry_attempt: u32,
}

impl SelectionRecord {
    pub(crate) fn new(
        seed: SelectionSeed,
        seed_source: String,
        selected_witness_id: WitnessId,
        pool_snapshot: Vec<WitnessId>,
        selected_at: DateTime<Utc>,
        retry_attempt: u32,
    ) -> Self {
        Self {
            seed,
            seed_source,
            selected_witness_id,
            pool_snapshot,
            algorithm_version: ALGORITHM_VERSION.to_string(),
            selected_at,
            retry_attempt,
        }
    }

    /// Seed material.
    #[must_use]
    pub const fn seed(&self) -> &SelectionSeed {
        &self.seed
    }

    /// Provenance of the entropy.
    #[must_use]
    pub fn seed_source(&self) -> &str {
        &self.seed_source
    }

    /// The selected witness.
    #[must_use]
    pub const fn selected_witness_id(&self) -> &WitnessId {
        &self.selected_witness_id
    }

    /// The sorted pool the witness was drawn from.
    #[must_use]
    pub fn pool_snapshot(&self) -> &[WitnessId] {
        &self.pool_snapshot
    }

    /// Algorithm identifier.
    #[must_use]
    pub fn algorithm_version(&self) -> &str {
        &self.algorithm_version
    }

    /// Selection time.
    #[must_use]
    pub const fn selected_at(&self) -> DateTime<Utc> {
        self.selected_at
    }

    /// Retry attempt that produced the witness; 0 for the first candidate.
    #[must_use]
    pub const fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    /// Seed that indexes the pool for this record.
    #[must_use]
    pub fn effective_seed(&self) -> Seed {
        self.seed.effective_seed(self.retry_attempt)
    }

    /// Recomputes the selection from the record alone.
    ///
    /// # Errors
    ///
    /// Returns the [`VerificationError`] describing the first discrepancy.
    pub fn verify(&self) -> Result<(), VerificationError> {
        super::verify::verify(self)
    }

    /// Renders the record as canonical JSON for external signing.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError`] if the record cannot be rendered.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical::to_canonical_bytes(self)
    }
}
