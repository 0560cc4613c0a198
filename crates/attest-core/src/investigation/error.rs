//! Collusion investigator error types.

use thiserror::Error;

use super::state::InvestigationStatus;
use crate::ports::CollaboratorError;
use crate::store::StoreError;
use crate::types::IdentityError;

/// Errors that can occur in the investigation lifecycle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvestigationError {
    /// The system is halted; nothing was written.
    #[error("operation rejected: system halted ({reason})")]
    Halted {
        /// Halt reason reported by the halt checker.
        reason: String,
    },

    /// No investigation with the given id exists.
    #[error("investigation not found: {id}")]
    InvestigationNotFound {
        /// The requested id.
        id: String,
    },

    /// The investigation is already terminal and cannot be resolved again.
    #[error("investigation {id} already resolved as {status}")]
    InvestigationAlreadyResolved {
        /// The investigation id.
        id: String,
        /// Its terminal status.
        status: InvestigationStatus,
    },

    /// A pair key was malformed.
    #[error("invalid pair key: {0}")]
    InvalidPairKey(#[from] IdentityError),

    /// Breach data could not be read.
    #[error(transparent)]
    Source(#[from] CollaboratorError),

    /// Investigation storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
