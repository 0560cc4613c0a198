//! # attest-core
//!
//! Witness selection and collusion defense for a governance ledger.
//!
//! Every ledger event is attested by witnesses drawn from a pool. This crate
//! decides who witnesses, in a way third parties can re-verify, and watches
//! for witness pairs that behave as though they coordinate.
//!
//! ## Components
//!
//! - [`selection::WitnessSelector`]: verifiable selection from external
//!   entropy and the ledger chain head, with pair rotation
//! - [`pair_history::PairHistoryTracker`]: the 24-hour pair rotation window
//! - [`anomaly::AnomalyDetector`]: co-occurrence and unavailability scans,
//!   time-boxed pair exclusions
//! - [`investigation::CollusionInvestigator`]: investigation lifecycle,
//!   pair suspension and the permanent ban list
//! - [`pool::PoolMonitor`]: effective pool size and degraded mode
//! - [`sweep::CollusionSweep`]: scans, excludes and escalates in one pass
//!
//! ## Collaborators
//!
//! Entropy, the hash chain, the halt flag, the witness pool, witness
//! activity and breach records all come from outside the crate through the
//! traits in [`ports`], [`anomaly`] and [`investigation`]. Each has an
//! in-memory implementation for tests and embedding. Durable state lives
//! behind the [`store`] traits, with an in-memory and a `SQLite` adapter.
//!
//! State transitions are reported as [`events::WitnessEvent`]s rendered to
//! canonical JSON. Signing them is the ledger's job.
//!
//! ## Halts
//!
//! Operations that change state (selecting, excluding, triggering,
//! resolving) consult the [`ports::HaltChecker`] first and fail with a
//! `Halted` error while the system is halted. Scans and queries are reads
//! and always run.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod anomaly;
pub mod canonical;
pub mod clock;
pub mod config;
pub mod events;
pub mod gate;
pub mod investigation;
pub mod pair_history;
pub mod pool;
pub mod ports;
pub mod selection;
pub mod store;
pub mod sweep;
pub mod types;

pub use anomaly::{AnomalyDetector, AnomalyError, AnomalyResult, AnomalyType, PairExclusion};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, WitnessPolicyConfig};
pub use events::{WitnessEvent, WitnessEventSink};
pub use gate::{CompositeExclusionGate, ExcludedWitnessSource, ExclusionGate};
pub use investigation::{
    CollusionInvestigator, Investigation, InvestigationError, InvestigationStatus, Resolution,
};
pub use pair_history::PairHistoryTracker;
pub use pool::{OperationGate, PoolError, PoolMonitor, PoolStatus};
pub use selection::{
    SelectionError, SelectionRecord, VerificationError, WitnessSelector, verify_claim,
};
pub use store::{MemoryWitnessStore, SqliteWitnessStore, StoreError};
pub use sweep::{CollusionSweep, SweepError, SweepReport};
pub use types::{WitnessId, WitnessPair};
