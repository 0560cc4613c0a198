//! Anomaly detector error types.

use thiserror::Error;

use crate::canonical::CanonicalError;
use crate::ports::CollaboratorError;
use crate::store::StoreError;

/// Errors that can occur during anomaly scans and exclusion management.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AnomalyError {
    /// The system is halted; no exclusion state was changed.
    #[error("operation rejected: system halted ({reason})")]
    Halted {
        /// Halt reason reported by the halt checker.
        reason: String,
    },

    /// A window or exclusion duration was not positive.
    #[error("duration must be positive, got {hours}h")]
    InvalidDuration {
        /// The rejected duration in whole hours.
        hours: i64,
    },

    /// A confidence value was NaN or outside `[0, 1]`.
    #[error("confidence must be within [0, 1], got {value}")]
    InvalidConfidence {
        /// String rendering of the rejected value.
        value: String,
    },

    /// A pair key was malformed.
    #[error("invalid pair key: {0}")]
    InvalidPairKey(#[from] crate::types::IdentityError),

    /// Activity or pool data could not be read.
    #[error(transparent)]
    Source(#[from] CollaboratorError),

    /// Exclusion storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A finding could not be rendered for witnessing.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}
