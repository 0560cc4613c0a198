//! Selection and verification error types.

use thiserror::Error;

use crate::ports::CollaboratorError;
use crate::store::StoreError;
use crate::types::WitnessId;

/// Errors from recomputing a selection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerificationError {
    /// The pool snapshot is empty; no witness could have been selected.
    #[error("pool snapshot is empty")]
    EmptyPool,

    /// The pool snapshot is not strictly ascending.
    #[error("pool snapshot is not sorted and deduplicated at position {position}")]
    UnsortedSnapshot {
        /// Index of the first out-of-order entry.
        position: usize,
    },

    /// The stored combined seed does not match its entropy and chain hash.
    #[error("combined seed does not match entropy and chain hash")]
    SeedTampered,

    /// The recomputed witness differs from the claimed one.
    #[error("selection mismatch: expected {expected}, claimed {claimed}")]
    Mismatch {
        /// Witness the seed actually selects.
        expected: WitnessId,
        /// Witness the record claims.
        claimed: WitnessId,
    },

    /// The record names an algorithm this build does not implement.
    #[error("unsupported selection algorithm: {version}")]
    UnsupportedAlgorithm {
        /// The recorded algorithm version.
        version: String,
    },
}

/// Errors from [`crate::selection::WitnessSelector::select`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SelectionError {
    /// The system is halted; no collaborator was called.
    #[error("selection rejected: system halted ({reason})")]
    Halted {
        /// Halt reason reported by the halt checker.
        reason: String,
    },

    /// The entropy source failed. Selection never falls back to weaker
    /// randomness.
    #[error("entropy unavailable from {source_id}: {message}")]
    EntropyUnavailable {
        /// Identifier of the failing source.
        source_id: String,
        /// Failure description.
        message: String,
    },

    /// The ledger hash chain could not be read.
    #[error("hash chain unavailable: {0}")]
    ChainUnavailable(#[source] CollaboratorError),

    /// The witness pool could not be read.
    #[error("witness pool unavailable: {0}")]
    PoolUnavailable(#[source] CollaboratorError),

    /// The pool is smaller than the operation requires.
    #[error("insufficient witness pool: {available} available, {required} required")]
    InsufficientPool {
        /// Witnesses in the pool.
        available: usize,
        /// Minimum for the operation.
        required: usize,
    },

    /// Every deterministic retry hit a blocked pair.
    #[error("all candidate pairs exhausted: pool of {pool_size}, {attempts} attempts")]
    PairsExhausted {
        /// Witnesses in the pool.
        pool_size: usize,
        /// Candidates tried, including the first.
        attempts: u32,
    },

    /// A freshly built record failed its own verification.
    #[error("selection failed verification: {0}")]
    VerificationFailed(#[from] VerificationError),

    /// Pair history, exclusion or previous-witness storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
