//! Raw witness activity consumed by anomaly scans.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::CollaboratorError;
use crate::types::WitnessId;

/// An event attested by a set of witnesses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessedEvent {
    /// Ledger event id.
    pub event_id: String,
    /// Witnesses that attested the event.
    pub witnesses: Vec<WitnessId>,
    /// When the event was witnessed.
    pub witnessed_at: DateTime<Utc>,
}

/// A witness failing to respond when selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailabilityRecord {
    /// The unavailable witness.
    pub witness: WitnessId,
    /// When the failure was observed.
    pub occurred_at: DateTime<Utc>,
    /// Free-form cause (timeout, refusal, ...).
    pub reason: String,
}

/// Source of witness activity for statistical scans.
#[async_trait]
pub trait WitnessActivitySource: Send + Sync {
    /// Returns events witnessed strictly after `since`.
    async fn witnessed_events_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WitnessedEvent>, CollaboratorError>;

    /// Returns unavailability observed strictly after `since`.
    async fn unavailability_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UnavailabilityRecord>, CollaboratorError>;
}

/// Append-only in-memory activity log.
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    events: RwLock<Vec<WitnessedEvent>>,
    unavailability: RwLock<Vec<UnavailabilityRecord>>,
}

impl MemoryActivityLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a witnessed event.
    pub fn record_event(
        &self,
        event_id: impl Into<String>,
        witnesses: Vec<WitnessId>,
        witnessed_at: DateTime<Utc>,
    ) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(WitnessedEvent {
                event_id: event_id.into(),
                witnesses,
                witnessed_at,
            });
    }

    /// Appends an unavailability observation.
    pub fn record_unavailability(
        &self,
        witness: WitnessId,
        occurred_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) {
        self.unavailability
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(UnavailabilityRecord {
                witness,
                occurred_at,
                reason: reason.into(),
            });
    }
}

#[async_trait]
impl WitnessActivitySource for MemoryActivityLog {
    async fn witnessed_events_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<WitnessedEvent>, CollaboratorError> {
        Ok(self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.witnessed_at > since)
            .cloned()
            .collect())
    }

    async fn unavailability_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UnavailabilityRecord>, CollaboratorError> {
        Ok(self
            .unavailability
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.occurred_at > since)
            .cloned()
            .collect())
    }
}
