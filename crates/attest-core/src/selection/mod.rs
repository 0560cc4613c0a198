//! Verifiable witness selection.
//!
//! A selection mixes external entropy with the current ledger chain head,
//! hashes the result, and uses the first eight bytes of the hash to index a
//! sorted snapshot of the witness pool. Every input is kept in the
//! [`SelectionRecord`], so anyone can recompute the choice with [`verify`]
//! without access to the selector.
//!
//! When a previous witness is known the selector also enforces pair
//! rotation: a pair used within the rotation window, or blocked by an
//! [`crate::gate::ExclusionGate`], is skipped in favour of deterministic
//! retry candidates.
//!
//! # Example
//!
//! ```rust
//! use attest_core::selection::{SelectionSeed, expected_witness, verify_claim};
//! use attest_core::types::WitnessId;
//!
//! let pool: Vec<WitnessId> = ["alice", "bob", "carol"]
//!     .into_iter()
//!     .map(|id| WitnessId::new(id).unwrap())
//!     .collect();
//! let seed = SelectionSeed::compute(vec![7; 32], "genesis");
//! let chosen = expected_witness(seed.combined_seed(), &pool).unwrap();
//! assert!(verify_claim(seed.combined_seed(), &pool, chosen).is_ok());
//! ```

mod error;
mod record;
mod seed;
mod selector;
mod verify;

#[cfg(test)]
mod tests;

pub use error::{SelectionError, VerificationError};
pub use record::{ALGORITHM_VERSION, SelectionRecord};
pub use seed::{SEED_LEN, Seed, SelectionSeed, combine, retry_seed, seed_index};
pub use selector::{MemoryPreviousWitness, PreviousWitnessStore, WitnessSelector};
pub use verify::{expected_witness, verify, verify_claim};
