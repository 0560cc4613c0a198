//! Collusion investigation lifecycle and the permanent ban list.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::breach::{BreachSource, breach_correlation};
use super::error::InvestigationError;
use super::state::{Investigation, InvestigationStatus, Resolution};
use crate::canonical;
use crate::clock::Clock;
use crate::config::InvestigationPolicy;
use crate::events::{WitnessEvent, WitnessEventSink};
use crate::gate::{self, ExcludedWitnessSource, ExclusionGate};
use crate::ports::{self, HaltChecker};
use crate::store::{InsertOutcome, InvestigationStore, ResolveOutcome, StoreError};
use crate::types::{WitnessId, WitnessPair};

/// Correlation strictly above which an investigation is warranted.
pub const CORRELATION_TRIGGER_THRESHOLD: f64 = 0.8;

/// Returns true if `correlation` exceeds [`CORRELATION_TRIGGER_THRESHOLD`].
#[must_use]
pub fn is_trigger_warranted(correlation: f64) -> bool {
    correlation > CORRELATION_TRIGGER_THRESHOLD
}

/// Opens, resolves and answers questions about collusion investigations.
///
/// An open investigation suspends its pair; a `CONFIRMED` resolution bans the
/// pair forever. Whether to open an investigation at all is the caller's
/// decision (see [`is_trigger_warranted`]).
pub struct CollusionInvestigator {
    store: Arc<dyn InvestigationStore>,
    breaches: Arc<dyn BreachSource>,
    halt: Arc<dyn HaltChecker>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn WitnessEventSink>,
    policy: InvestigationPolicy,
}

impl std::fmt::Debug for CollusionInvestigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollusionInvestigator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CollusionInvestigator {
    /// Creates an investigator with the default policy.
    #[must_use]
    pub fn new(
        store: Arc<dyn InvestigationStore>,
        breaches: Arc<dyn BreachSource>,
        halt: Arc<dyn HaltChecker>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn WitnessEventSink>,
    ) -> Self {
        Self {
            store,
            breaches,
            halt,
            clock,
            events,
            policy: InvestigationPolicy::default(),
        }
    }

    /// Replaces the trigger policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: InvestigationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns true if `correlation` exceeds the configured threshold.
    #[must_use]
    pub fn trigger_warranted(&self, correlation: f64) -> bool {
        correlation > self.policy.correlation_threshold
    }

    /// Opens an investigation into `pair_key` and suspends the pair.
    ///
    /// The correlation score is computed from `breach_ids` at trigger time.
    /// If the pair already has an `ACTIVE` investigation its id is returned
    /// and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`InvestigationError::Halted`] during a halt,
    /// [`InvestigationError::InvalidPairKey`] for a non-canonical key, or a
    /// source/store error.
    pub async fn trigger(
        &self,
        pair_key: &str,
        anomaly_ids: Vec<String>,
        breach_ids: Vec<String>,
    ) -> Result<String, InvestigationError> {
        if let Some(reason) = ports::halted(self.halt.as_ref()).await {
            warn!(pair_key, %reason, "investigation trigger rejected: system halted");
            return Err(InvestigationError::Halted { reason });
        }
        let pair = WitnessPair::from_canonical_key(pair_key)?;
        let correlation = self.correlation(&pair, &breach_ids).await?;

        let investigation = Investigation::open(
            Uuid::new_v4().to_string(),
            pair_key,
            self.clock.now(),
            anomaly_ids,
            breach_ids,
            correlation,
        );

        match self.store.insert_unless_active(investigation.clone()).await? {
            InsertOutcome::Created(id) => {
                info!(
                    investigation_id = %id,
                    pair_key,
                    correlation,
                    "investigation opened, pair suspended"
                );
                self.events.emit(WitnessEvent::PairSuspended {
                    investigation_id: id.clone(),
                    pair_key: pair_key.to_string(),
                    correlation_bp: canonical::to_basis_points(investigation.correlation_score()),
                    triggering_anomaly_ids: investigation.triggering_anomaly_ids().to_vec(),
                    triggered_at: investigation.triggered_at(),
                });
                Ok(id)
            },
            InsertOutcome::Existing(id) => {
                debug!(investigation_id = %id, pair_key, "pair already under investigation");
                Ok(id)
            },
        }
    }

    /// Resolves an `ACTIVE` investigation.
    ///
    /// `CLEARED` lifts the suspension. `CONFIRMED` also bans the pair
    /// permanently.
    ///
    /// # Errors
    ///
    /// Returns [`InvestigationError::Halted`] during a halt,
    /// [`InvestigationError::InvestigationNotFound`] for an unknown id and
    /// [`InvestigationError::InvestigationAlreadyResolved`] if the
    /// investigation is terminal, including when a concurrent resolution
    /// won the race.
    pub async fn resolve(
        &self,
        id: &str,
        resolution: Resolution,
        reason: &str,
        resolved_by: &str,
    ) -> Result<Investigation, InvestigationError> {
        if let Some(halt_reason) = ports::halted(self.halt.as_ref()).await {
            warn!(investigation_id = id, reason = %halt_reason, "resolution rejected: system halted");
            return Err(InvestigationError::Halted {
                reason: halt_reason,
            });
        }
        let current = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| InvestigationError::InvestigationNotFound { id: id.to_string() })?;
        let resolved = current.resolved(resolution, reason, resolved_by, self.clock.now())?;

        match self.store.resolve_if_active(&resolved).await? {
            ResolveOutcome::Resolved => {
                info!(
                    investigation_id = id,
                    pair_key = resolved.pair_key(),
                    %resolution,
                    resolved_by,
                    "investigation resolved"
                );
                self.events.emit(WitnessEvent::InvestigationResolved {
                    investigation_id: id.to_string(),
                    pair_key: resolved.pair_key().to_string(),
                    resolution,
                    resolved_by: resolved_by.to_string(),
                    reason: reason.to_string(),
                    resolved_at: resolved.resolved_at().unwrap_or_else(|| self.clock.now()),
                });
                Ok(resolved)
            },
            ResolveOutcome::NotFound => {
                Err(InvestigationError::InvestigationNotFound { id: id.to_string() })
            },
            ResolveOutcome::AlreadyResolved(status) => {
                warn!(investigation_id = id, %status, "concurrent resolution already applied");
                Err(InvestigationError::InvestigationAlreadyResolved {
                    id: id.to_string(),
                    status,
                })
            },
        }
    }

    /// Returns true while `pair_key` has an `ACTIVE` investigation.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn is_under_investigation(&self, pair_key: &str) -> Result<bool, InvestigationError> {
        Ok(self.store.active_for_pair(pair_key).await?.is_some())
    }

    /// Returns the share of `breach_ids` that implicate both members of
    /// `pair`, capped at 1.0. Ids the breach source does not know are
    /// ignored; with no known breaches the correlation is 0.
    ///
    /// # Errors
    ///
    /// Returns a source error if the breaches cannot be read.
    pub async fn correlation(
        &self,
        pair: &WitnessPair,
        breach_ids: &[String],
    ) -> Result<f64, InvestigationError> {
        if breach_ids.is_empty() {
            return Ok(0.0);
        }
        let breaches = self.breaches.breaches_by_id(breach_ids).await?;
        if breaches.len() < breach_ids.len() {
            debug!(
                requested = breach_ids.len(),
                found = breaches.len(),
                "some breach ids are unknown"
            );
        }
        Ok(breach_correlation(pair, &breaches))
    }

    /// Returns the permanently banned pair keys.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn banned_pairs(&self) -> Result<BTreeSet<String>, InvestigationError> {
        Ok(self.store.banned_pair_keys().await?)
    }

    /// Returns the keys of pairs with an `ACTIVE` investigation.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn suspended_pairs(&self) -> Result<BTreeSet<String>, InvestigationError> {
        Ok(self.suspended_keys().await?)
    }

    /// Returns the investigation with `id`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn get(&self, id: &str) -> Result<Option<Investigation>, InvestigationError> {
        Ok(self.store.get(id).await?)
    }

    /// Returns every `ACTIVE` investigation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn list_active(&self) -> Result<Vec<Investigation>, InvestigationError> {
        Ok(self.store.list_by_status(InvestigationStatus::Active).await?)
    }

    async fn suspended_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .store
            .list_by_status(InvestigationStatus::Active)
            .await?
            .into_iter()
            .map(|inv| inv.pair_key)
            .collect())
    }
}

#[async_trait]
impl ExclusionGate for CollusionInvestigator {
    async fn is_pair_blocked(&self, pair_key: &str) -> Result<bool, StoreError> {
        if self.store.banned_pair_keys().await?.contains(pair_key) {
            return Ok(true);
        }
        Ok(self.store.active_for_pair(pair_key).await?.is_some())
    }
}

#[async_trait]
impl ExcludedWitnessSource for CollusionInvestigator {
    async fn excluded_witnesses(&self) -> Result<BTreeSet<WitnessId>, StoreError> {
        let mut keys = self.suspended_keys().await?;
        keys.extend(self.store.banned_pair_keys().await?);
        Ok(gate::members_of(keys.iter().map(String::as_str)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemoryEventSink;
    use crate::investigation::MemoryBreachLog;
    use crate::ports::HaltFlag;
    use crate::store::MemoryWitnessStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
    }

    fn w(id: &str) -> WitnessId {
        WitnessId::new(id).unwrap()
    }

    struct Fixture {
        breaches: Arc<MemoryBreachLog>,
        clock: Arc<ManualClock>,
        halt: Arc<HaltFlag>,
        sink: Arc<MemoryEventSink>,
        investigator: CollusionInvestigator,
    }

    fn fixture() -> Fixture {
        let breaches = Arc::new(MemoryBreachLog::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let halt = Arc::new(HaltFlag::new());
        let sink = Arc::new(MemoryEventSink::new());
        let investigator = CollusionInvestigator::new(
            Arc::new(MemoryWitnessStore::new()),
            breaches.clone(),
            halt.clone(),
            clock.clone(),
            sink.clone(),
        );
        Fixture {
            breaches,
            clock,
            halt,
            sink,
            investigator,
        }
    }

    #[tokio::test]
    async fn trigger_suspends_pair() {
        let fx = fixture();
        let id = fx
            .investigator
            .trigger("a:b", vec!["anomaly-1".to_string()], vec![])
            .await
            .unwrap();

        assert!(Uuid::parse_str(&id).is_ok());
        assert!(fx.investigator.is_under_investigation("a:b").await.unwrap());
        assert!(fx.investigator.is_pair_blocked("a:b").await.unwrap());
        assert_eq!(
            fx.investigator.suspended_pairs().await.unwrap(),
            BTreeSet::from(["a:b".to_string()])
        );
        assert_eq!(fx.sink.of_type("PAIR_SUSPENDED").len(), 1);

        let inv = fx.investigator.get(&id).await.unwrap().unwrap();
        assert_eq!(inv.triggering_anomaly_ids(), &["anomaly-1".to_string()]);
        assert_eq!(inv.triggered_at(), t0());
    }

    #[tokio::test]
    async fn trigger_is_idempotent_per_pair() {
        let fx = fixture();
        let first = fx.investigator.trigger("a:b", vec![], vec![]).await.unwrap();
        let second = fx.investigator.trigger("a:b", vec![], vec![]).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fx.investigator.list_active().await.unwrap().len(), 1);
        assert_eq!(fx.sink.of_type("PAIR_SUSPENDED").len(), 1);
    }

    #[tokio::test]
    async fn cleared_lifts_suspension_without_ban() {
        let fx = fixture();
        let id = fx.investigator.trigger("a:b", vec![], vec![]).await.unwrap();
        fx.clock.advance(Duration::hours(6));

        let cleared = fx
            .investigator
            .resolve(&id, Resolution::Cleared, "coincidence", "auditor")
            .await
            .unwrap();

        assert_eq!(cleared.status(), InvestigationStatus::Cleared);
        assert_eq!(cleared.resolved_at(), Some(t0() + Duration::hours(6)));
        assert!(!fx.investigator.is_under_investigation("a:b").await.unwrap());
        assert!(!fx.investigator.is_pair_blocked("a:b").await.unwrap());
        assert!(fx.investigator.banned_pairs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirmed_bans_pair_forever() {
        let fx = fixture();
        let id = fx.investigator.trigger("a:b", vec![], vec![]).await.unwrap();
        fx.investigator
            .resolve(&id, Resolution::Confirmed, "coordinated", "auditor")
            .await
            .unwrap();
        fx.clock.advance(Duration::days(3650));

        assert!(fx.investigator.is_pair_blocked("a:b").await.unwrap());
        assert_eq!(
            fx.investigator.banned_pairs().await.unwrap(),
            BTreeSet::from(["a:b".to_string()])
        );
        assert_eq!(
            fx.investigator.excluded_witnesses().await.unwrap(),
            BTreeSet::from([w("a"), w("b")])
        );
    }

    #[tokio::test]
    async fn second_resolution_always_fails() {
        let fx = fixture();
        let id = fx.investigator.trigger("a:b", vec![], vec![]).await.unwrap();
        fx.investigator
            .resolve(&id, Resolution::Cleared, "first", "auditor")
            .await
            .unwrap();

        for resolution in [Resolution::Cleared, Resolution::Confirmed] {
            let err = fx
                .investigator
                .resolve(&id, resolution, "second", "auditor")
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                InvestigationError::InvestigationAlreadyResolved {
                    status: InvestigationStatus::Cleared,
                    ..
                }
            ));
        }
        let stored = fx.investigator.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.reason(), Some("first"));
        assert_eq!(fx.sink.of_type("INVESTIGATION_RESOLVED").len(), 1);
    }

    #[tokio::test]
    async fn resolve_unknown_id_fails() {
        let fx = fixture();
        let err = fx
            .investigator
            .resolve("nope", Resolution::Cleared, "", "")
            .await
            .unwrap_err();
        assert!(matches!(err, InvestigationError::InvestigationNotFound { id } if id == "nope"));
    }

    #[tokio::test]
    async fn halt_rejects_trigger_and_resolve() {
        let fx = fixture();
        let id = fx.investigator.trigger("a:b", vec![], vec![]).await.unwrap();
        fx.halt.halt("maintenance");

        assert!(matches!(
            fx.investigator.trigger("c:d", vec![], vec![]).await,
            Err(InvestigationError::Halted { .. })
        ));
        assert!(matches!(
            fx.investigator
                .resolve(&id, Resolution::Cleared, "", "")
                .await,
            Err(InvestigationError::Halted { .. })
        ));
        assert!(fx.investigator.is_under_investigation("a:b").await.unwrap());
    }

    #[tokio::test]
    async fn trigger_rejects_non_canonical_key() {
        let fx = fixture();
        assert!(matches!(
            fx.investigator.trigger("b:a", vec![], vec![]).await,
            Err(InvestigationError::InvalidPairKey(_))
        ));
    }

    #[tokio::test]
    async fn correlation_is_stored_on_trigger() {
        let fx = fixture();
        let mut ids = Vec::new();
        for i in 0..4 {
            let witnesses = if i < 3 {
                vec![w("a"), w("b")]
            } else {
                vec![w("c")]
            };
            fx.breaches.record(format!("b{i}"), witnesses, t0());
            ids.push(format!("b{i}"));
        }

        let pair = WitnessPair::new(w("a"), w("b"));
        let correlation = fx.investigator.correlation(&pair, &ids).await.unwrap();
        assert!((correlation - 0.75).abs() < f64::EPSILON);
        assert!(!fx.investigator.trigger_warranted(correlation));

        let id = fx.investigator.trigger("a:b", vec![], ids).await.unwrap();
        let inv = fx.investigator.get(&id).await.unwrap().unwrap();
        assert!((inv.correlation_score() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn trigger_threshold_is_strict() {
        assert!(!is_trigger_warranted(0.8));
        assert!(is_trigger_warranted(0.85));
    }
}
