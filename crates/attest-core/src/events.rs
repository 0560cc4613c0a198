//! Witnessable state transitions.
//!
//! Every state change the core makes is described by a [`WitnessEvent`] and
//! handed to a [`WitnessEventSink`]. Events render to canonical JSON via
//! [`WitnessEvent::to_canonical_bytes`]; signing those bytes is left to the
//! surrounding ledger.
//!
//! Event payloads are integer-only. Ratios travel as basis points and
//! timestamps as RFC 3339 strings.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::anomaly::AnomalyPayload;
use crate::canonical::{self, CanonicalError};
use crate::investigation::Resolution;
use crate::types::WitnessId;

/// A state transition to be witnessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum WitnessEvent {
    /// A witness was selected.
    SelectionMade {
        /// The selected witness.
        witness_id: WitnessId,
        /// Entropy provenance.
        seed_source: String,
        /// Hex of the combined seed.
        combined_seed: String,
        /// Retry attempt that produced the witness (0 = first candidate).
        retry_attempt: u32,
        /// Size of the pool snapshot.
        pool_size: u64,
        /// Selection time.
        selected_at: DateTime<Utc>,
    },

    /// A pair was excluded from selection for a bounded time.
    PairExcluded {
        /// Canonical pair key.
        pair_key: String,
        /// Exclusion start.
        excluded_at: DateTime<Utc>,
        /// Exclusion end.
        excluded_until: DateTime<Utc>,
        /// Why.
        reason: String,
        /// Confidence in basis points.
        confidence_bp: u32,
    },

    /// An exclusion was cleared manually.
    PairExclusionCleared {
        /// Canonical pair key.
        pair_key: String,
        /// When it was cleared.
        cleared_at: DateTime<Utc>,
    },

    /// A scan reported an anomaly.
    AnomalyReported {
        /// Content-derived anomaly id.
        anomaly_id: String,
        /// The finding.
        anomaly: AnomalyPayload,
        /// Scan time.
        reported_at: DateTime<Utc>,
    },

    /// An investigation was opened and the pair suspended.
    PairSuspended {
        /// Investigation id.
        investigation_id: String,
        /// Canonical pair key.
        pair_key: String,
        /// Breach correlation in basis points.
        correlation_bp: u32,
        /// Anomalies behind the trigger.
        triggering_anomaly_ids: Vec<String>,
        /// Trigger time.
        triggered_at: DateTime<Utc>,
    },

    /// An investigation reached a terminal status.
    InvestigationResolved {
        /// Investigation id.
        investigation_id: String,
        /// Canonical pair key.
        pair_key: String,
        /// Outcome.
        resolution: Resolution,
        /// Resolver.
        resolved_by: String,
        /// Reason given.
        reason: String,
        /// Resolution time.
        resolved_at: DateTime<Utc>,
    },

    /// The effective pool fell below the high-stakes minimum.
    PoolDegraded {
        /// Effective witness count.
        effective_count: u64,
        /// High-stakes minimum.
        required: u64,
        /// When degradation was first observed.
        degraded_since: DateTime<Utc>,
    },

    /// The effective pool is back at or above the high-stakes minimum.
    PoolRecovered {
        /// Effective witness count.
        effective_count: u64,
        /// When the degradation began.
        degraded_since: DateTime<Utc>,
        /// When recovery was observed.
        recovered_at: DateTime<Utc>,
    },
}

impl WitnessEvent {
    /// Returns the stable event type code.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::SelectionMade { .. } => "SELECTION_MADE",
            Self::PairExcluded { .. } => "PAIR_EXCLUDED",
            Self::PairExclusionCleared { .. } => "PAIR_EXCLUSION_CLEARED",
            Self::AnomalyReported { .. } => "ANOMALY_REPORTED",
            Self::PairSuspended { .. } => "PAIR_SUSPENDED",
            Self::InvestigationResolved { .. } => "INVESTIGATION_RESOLVED",
            Self::PoolDegraded { .. } => "POOL_DEGRADED",
            Self::PoolRecovered { .. } => "POOL_RECOVERED",
        }
    }

    /// Renders the event as canonical JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError`] if the event cannot be serialized.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical::to_canonical_bytes(self)
    }
}

/// Consumer of witnessable events.
///
/// Emission is synchronous and infallible from the core's point of view.
/// Sinks that forward to fallible transports must buffer or log failures
/// themselves.
pub trait WitnessEventSink: Send + Sync {
    /// Receives one event.
    fn emit(&self, event: WitnessEvent);
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<WitnessEvent>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<WitnessEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the received events whose type code is `event_type`.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<WitnessEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Removes and returns every received event.
    pub fn drain(&self) -> Vec<WitnessEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl WitnessEventSink for MemoryEventSink {
    fn emit(&self, event: WitnessEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Sink that logs each event's canonical form at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl WitnessEventSink for TracingEventSink {
    fn emit(&self, event: WitnessEvent) {
        match canonical::to_canonical_string(&event) {
            Ok(canonical) => {
                tracing::info!(event_type = event.event_type(), %canonical, "witness event");
            },
            Err(e) => {
                tracing::warn!(
                    event_type = event.event_type(),
                    error = %e,
                    "witness event could not be rendered"
                );
            },
        }
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl WitnessEventSink for NullEventSink {
    fn emit(&self, _event: WitnessEvent) {}
}
