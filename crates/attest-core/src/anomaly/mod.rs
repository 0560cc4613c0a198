//! Anomaly detection over witness co-occurrence and unavailability.
//!
//! Scans read raw activity from a [`WitnessActivitySource`], score
//! over-representation with a single-cell chi-square test (see
//! [`statistics`]) and report findings at or above the report threshold.
//! The detector also owns time-boxed [`PairExclusion`]s, which the selector
//! consumes through [`crate::gate::ExclusionGate`].

mod activity;
mod detector;
mod error;
pub mod statistics;
mod types;

pub use activity::{MemoryActivityLog, UnavailabilityRecord, WitnessActivitySource, WitnessedEvent};
pub use detector::AnomalyDetector;
pub(crate) use detector::positive_hours;
pub use error::AnomalyError;
pub use types::{AnomalyPayload, AnomalyResult, AnomalyType, PairExclusion};
