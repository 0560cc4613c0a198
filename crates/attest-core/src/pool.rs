//! Witness pool health.
//!
//! The effective pool is the active pool minus every witness some
//! [`ExcludedWitnessSource`] reports as unusable. The pool is *degraded*
//! while the effective count is below the high-stakes minimum, whatever kind
//! of operation is being considered.
//!
//! Status is recomputed on every query. The only state kept is the instant
//! degradation was first observed, held in memory and lost on restart.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SelectionPolicy;
use crate::events::{WitnessEvent, WitnessEventSink};
use crate::gate::ExcludedWitnessSource;
use crate::ports::{self, CollaboratorError, WitnessPool};
use crate::store::StoreError;
use crate::types::WitnessId;

/// Errors raised while computing pool status.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The witness pool could not be read.
    #[error(transparent)]
    Source(#[from] CollaboratorError),

    /// An exclusion source failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Point-in-time pool health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Active witnesses in the pool.
    pub available_count: usize,
    /// Active witnesses that are currently excluded.
    pub excluded_witnesses: BTreeSet<WitnessId>,
    /// `available_count - |excluded_witnesses|`, floored at 0.
    pub effective_count: usize,
    /// True while `effective_count` is below the high-stakes minimum.
    pub is_degraded: bool,
    /// When the current degradation was first observed.
    pub degraded_since: Option<DateTime<Utc>>,
}

/// Answer to [`PoolMonitor::can_perform`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationGate {
    /// Whether the operation may proceed.
    pub permitted: bool,
    /// Human-readable explanation.
    pub reason: String,
    /// Effective pool size at the time of the check.
    pub effective_count: usize,
    /// Minimum required for the operation.
    pub required: usize,
}

impl fmt::Display for OperationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

enum ModeChange {
    Degraded(DateTime<Utc>),
    Recovered(DateTime<Utc>),
}

/// Computes pool health and gates operations on it.
pub struct PoolMonitor {
    pool: Arc<dyn WitnessPool>,
    exclusion_sources: Vec<Arc<dyn ExcludedWitnessSource>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn WitnessEventSink>,
    policy: SelectionPolicy,
    degraded_since: Mutex<Option<DateTime<Utc>>>,
}

impl fmt::Debug for PoolMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolMonitor")
            .field("policy", &self.policy)
            .field("exclusion_sources", &self.exclusion_sources.len())
            .field("degraded_since", &self.degraded_since())
            .finish_non_exhaustive()
    }
}

impl PoolMonitor {
    /// Creates a monitor with the default minimums (6 standard, 12
    /// high-stakes).
    #[must_use]
    pub fn new(
        pool: Arc<dyn WitnessPool>,
        exclusion_sources: Vec<Arc<dyn ExcludedWitnessSource>>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn WitnessEventSink>,
    ) -> Self {
        Self {
            pool,
            exclusion_sources,
            clock,
            events,
            policy: SelectionPolicy::default(),
            degraded_since: Mutex::new(None),
        }
    }

    /// Replaces the pool-size minimums.
    #[must_use]
    pub const fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Computes the current pool status and updates degraded-mode
    /// bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] if the pool or an exclusion source cannot be
    /// read.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let snapshot = ports::sorted_snapshot(self.pool.as_ref()).await?;
        let active: BTreeSet<WitnessId> = snapshot.into_iter().collect();

        let mut excluded = BTreeSet::new();
        for source in &self.exclusion_sources {
            excluded.extend(
                source
                    .excluded_witnesses()
                    .await?
                    .into_iter()
                    .filter(|w| active.contains(w)),
            );
        }

        let available_count = active.len();
        let effective_count = available_count.saturating_sub(excluded.len());
        let is_degraded = effective_count < self.policy.high_stakes_minimum;
        let now = self.clock.now();

        let (degraded_since, change) = {
            let mut since = self
                .degraded_since
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let change = match (is_degraded, *since) {
                (true, None) => {
                    *since = Some(now);
                    Some(ModeChange::Degraded(now))
                },
                (false, Some(start)) => {
                    *since = None;
                    Some(ModeChange::Recovered(start))
                },
                _ => None,
            };
            (*since, change)
        };

        match change {
            Some(ModeChange::Degraded(at)) => {
                warn!(
                    effective_count,
                    required = self.policy.high_stakes_minimum,
                    excluded = excluded.len(),
                    "witness pool degraded"
                );
                self.events.emit(WitnessEvent::PoolDegraded {
                    effective_count: effective_count as u64,
                    required: self.policy.high_stakes_minimum as u64,
                    degraded_since: at,
                });
            },
            Some(ModeChange::Recovered(start)) => {
                info!(effective_count, since = %start, "witness pool recovered");
                self.events.emit(WitnessEvent::PoolRecovered {
                    effective_count: effective_count as u64,
                    degraded_since: start,
                    recovered_at: now,
                });
            },
            None => {},
        }

        debug!(available_count, effective_count, is_degraded, "pool status computed");
        Ok(PoolStatus {
            available_count,
            excluded_witnesses: excluded,
            effective_count,
            is_degraded,
            degraded_since,
        })
    }

    /// Returns true while the effective pool is below the high-stakes
    /// minimum.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] if status cannot be computed.
    pub async fn is_degraded(&self) -> Result<bool, PoolError> {
        Ok(self.status().await?.is_degraded)
    }

    /// Decides whether an operation of the given class may proceed.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] if status cannot be computed.
    pub async fn can_perform(&self, high_stakes: bool) -> Result<OperationGate, PoolError> {
        let status = self.status().await?;
        let required = self.policy.required(high_stakes);
        let class = if high_stakes { "high-stakes" } else { "standard" };
        let permitted = status.effective_count >= required;
        let reason = if permitted {
            format!(
                "{class} operation permitted: {} effective witnesses (minimum {required})",
                status.effective_count
            )
        } else {
            format!(
                "{class} operation blocked: {} effective witnesses, {required} required \
                 ({} available, {} excluded)",
                status.effective_count,
                status.available_count,
                status.excluded_witnesses.len()
            )
        };
        Ok(OperationGate {
            permitted,
            reason,
            effective_count: status.effective_count,
            required,
        })
    }

    /// Returns when the current degradation was first observed. Does not
    /// recompute status.
    #[must_use]
    pub fn degraded_since(&self) -> Option<DateTime<Utc>> {
        *self
            .degraded_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
