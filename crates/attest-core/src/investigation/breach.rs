//! Breach records and pair correlation.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::CollaboratorError;
use crate::types::{WitnessId, WitnessPair};

/// A governance breach and the witnesses that attested the offending events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreachRecord {
    /// Breach id.
    pub breach_id: String,
    /// Witnesses implicated in the breach.
    pub witnesses: Vec<WitnessId>,
    /// When the breach occurred.
    pub occurred_at: DateTime<Utc>,
}

impl BreachRecord {
    /// Returns true if both members of `pair` are implicated.
    #[must_use]
    pub fn involves(&self, pair: &WitnessPair) -> bool {
        self.witnesses.contains(pair.first()) && self.witnesses.contains(pair.second())
    }
}

/// Source of breach records.
#[async_trait]
pub trait BreachSource: Send + Sync {
    /// Returns breaches that occurred strictly after `since`.
    async fn breaches_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BreachRecord>, CollaboratorError>;

    /// Returns the breaches with the given ids. Unknown ids are skipped.
    async fn breaches_by_id(&self, ids: &[String]) -> Result<Vec<BreachRecord>, CollaboratorError>;
}

/// In-memory breach log.
#[derive(Debug, Default)]
pub struct MemoryBreachLog {
    breaches: RwLock<Vec<BreachRecord>>,
}

impl MemoryBreachLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a breach.
    pub fn record(
        &self,
        breach_id: impl Into<String>,
        witnesses: Vec<WitnessId>,
        occurred_at: DateTime<Utc>,
    ) {
        self.breaches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BreachRecord {
                breach_id: breach_id.into(),
                witnesses,
                occurred_at,
            });
    }
}

#[async_trait]
impl BreachSource for MemoryBreachLog {
    async fn breaches_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BreachRecord>, CollaboratorError> {
        Ok(self
            .breaches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|b| b.occurred_at > since)
            .cloned()
            .collect())
    }

    async fn breaches_by_id(&self, ids: &[String]) -> Result<Vec<BreachRecord>, CollaboratorError> {
        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self
            .breaches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|b| wanted.contains(b.breach_id.as_str()))
            .cloned()
            .collect())
    }
}

/// Fraction of `breaches` that implicate both members of `pair`, capped at
/// 1.0. Breaches sharing an id are counted once. Returns 0 when there are no
/// breaches.
#[must_use]
#[expect(
    clippy::cast_precision_loss,
    reason = "breach counts are far below 2^52"
)]
pub fn breach_correlation(pair: &WitnessPair, breaches: &[BreachRecord]) -> f64 {
    let mut seen = BTreeSet::new();
    let mut total = 0usize;
    let mut involving = 0usize;
    for breach in breaches {
        if !seen.insert(breach.breach_id.as_str()) {
            continue;
        }
        total += 1;
        if breach.involves(pair) {
            involving += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    (involving as f64 / total as f64).min(1.0)
}
