//! Statistical scans and time-boxed pair exclusions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::activity::WitnessActivitySource;
use super::error::AnomalyError;
use super::statistics::{self, excess_confidence};
use super::types::{AnomalyResult, AnomalyType, PairExclusion};
use crate::clock::Clock;
use crate::config::AnomalyPolicy;
use crate::events::{WitnessEvent, WitnessEventSink};
use crate::gate::{self, ExcludedWitnessSource, ExclusionGate};
use crate::ports::{self, HaltChecker, WitnessPool};
use crate::store::{ExclusionStore, StoreError};
use crate::types::{WitnessId, WitnessPair, pairs_of};

/// Converts whole hours to a duration, rejecting non-positive or
/// unrepresentable values.
pub(crate) fn positive_hours(hours: i64) -> Result<Duration, AnomalyError> {
    match Duration::try_hours(hours) {
        Some(duration) if hours > 0 => Ok(duration),
        _ => Err(AnomalyError::InvalidDuration { hours }),
    }
}

/// Runs co-occurrence and unavailability scans and owns pair exclusions.
///
/// Scans and exclusion lookups are reads and run while the system is halted.
/// Placing or clearing an exclusion is a write and is rejected during a halt.
pub struct AnomalyDetector {
    activity: Arc<dyn WitnessActivitySource>,
    pool: Arc<dyn WitnessPool>,
    exclusions: Arc<dyn ExclusionStore>,
    halt: Arc<dyn HaltChecker>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn WitnessEventSink>,
    policy: AnomalyPolicy,
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AnomalyDetector {
    /// Creates a detector with the default policy.
    #[must_use]
    pub fn new(
        activity: Arc<dyn WitnessActivitySource>,
        pool: Arc<dyn WitnessPool>,
        exclusions: Arc<dyn ExclusionStore>,
        halt: Arc<dyn HaltChecker>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn WitnessEventSink>,
    ) -> Self {
        Self {
            activity,
            pool,
            exclusions,
            halt,
            clock,
            events,
            policy: AnomalyPolicy::default(),
        }
    }

    /// Replaces the scan policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: AnomalyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the scan policy.
    #[must_use]
    pub const fn policy(&self) -> &AnomalyPolicy {
        &self.policy
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Reports witness pairs that co-occur more often than independent
    /// selection explains.
    ///
    /// For `M` witnessed events in the window and an active pool of `N`,
    /// each pair is expected `M / (N(N-1)/2)` times. Pairs seen more often
    /// than that are scored by chi-square confidence; those at or above the
    /// report threshold are returned, highest confidence first. A pair seen
    /// at least `excessive_pairing_ratio` times its expectation (and at
    /// least `excessive_pairing_min_count` times) is classed
    /// [`AnomalyType::ExcessivePairing`].
    ///
    /// # Errors
    ///
    /// Returns [`AnomalyError::InvalidDuration`] for a non-positive window,
    /// or a source error if activity or pool data cannot be read.
    pub async fn analyze_co_occurrence(
        &self,
        window_hours: i64,
    ) -> Result<Vec<AnomalyResult>, AnomalyError> {
        let since = self.window_start(window_hours)?;
        let events = self.activity.witnessed_events_since(since).await?;
        let pool = ports::sorted_snapshot(self.pool.as_ref()).await?;

        let total = events.len() as u64;
        let expected = statistics::expected_pair_count(total, pool.len());

        // Keyed by canonical key so detection order is key order.
        let mut counts: BTreeMap<String, (WitnessPair, u64)> = BTreeMap::new();
        for event in &events {
            for pair in pairs_of(&event.witnesses) {
                counts
                    .entry(pair.canonical_key())
                    .or_insert_with(|| (pair, 0))
                    .1 += 1;
            }
        }

        let mut results = Vec::new();
        for (key, (pair, observed)) in counts {
            let observed_f = to_f64(observed);
            if observed_f <= expected {
                continue;
            }
            let confidence = excess_confidence(observed_f, expected);
            if confidence < self.policy.report_threshold {
                continue;
            }
            let anomaly_type = if observed >= self.policy.excessive_pairing_min_count
                && observed_f >= self.policy.excessive_pairing_ratio * expected
            {
                AnomalyType::ExcessivePairing
            } else {
                AnomalyType::CoOccurrence
            };
            results.push(AnomalyResult::new(
                anomaly_type,
                confidence,
                vec![pair.first().clone(), pair.second().clone()],
                observed,
                expected,
                format!("pair {key} co-occurred {observed} times, expected {expected:.3}"),
            )?);
        }

        debug!(
            window_hours,
            events = total,
            pool_size = pool.len(),
            reported = results.len(),
            "co-occurrence scan complete"
        );
        self.finish_scan(results)
    }

    /// Reports witnesses that are unavailable disproportionately often.
    ///
    /// Each witness is expected `total / N` unavailability records in the
    /// window, where `N` is the active pool size.
    ///
    /// # Errors
    ///
    /// Returns [`AnomalyError::InvalidDuration`] for a non-positive window,
    /// or a source error if activity or pool data cannot be read.
    pub async fn analyze_unavailability(
        &self,
        window_hours: i64,
    ) -> Result<Vec<AnomalyResult>, AnomalyError> {
        let since = self.window_start(window_hours)?;
        let records = self.activity.unavailability_since(since).await?;
        let pool = ports::sorted_snapshot(self.pool.as_ref()).await?;

        let total = records.len() as u64;
        let expected = statistics::expected_share(total, pool.len());

        let mut counts: BTreeMap<&WitnessId, u64> = BTreeMap::new();
        for record in &records {
            *counts.entry(&record.witness).or_default() += 1;
        }

        let mut results = Vec::new();
        for (witness, observed) in counts {
            let observed_f = to_f64(observed);
            if observed_f <= expected {
                continue;
            }
            let confidence = excess_confidence(observed_f, expected);
            if confidence < self.policy.report_threshold {
                continue;
            }
            results.push(AnomalyResult::new(
                AnomalyType::UnavailabilityPattern,
                confidence,
                vec![witness.clone()],
                observed,
                expected,
                format!("witness {witness} unavailable {observed} times, expected {expected:.3}"),
            )?);
        }

        debug!(
            window_hours,
            records = total,
            pool_size = pool.len(),
            reported = results.len(),
            "unavailability scan complete"
        );
        self.finish_scan(results)
    }

    fn window_start(&self, window_hours: i64) -> Result<DateTime<Utc>, AnomalyError> {
        let window = positive_hours(window_hours)?;
        self.clock
            .now()
            .checked_sub_signed(window)
            .ok_or(AnomalyError::InvalidDuration {
                hours: window_hours,
            })
    }

    fn finish_scan(
        &self,
        mut results: Vec<AnomalyResult>,
    ) -> Result<Vec<AnomalyResult>, AnomalyError> {
        // Stable: equal confidences keep detection order.
        results.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));

        let reported_at = self.clock.now();
        for result in &results {
            let anomaly_id = result.anomaly_id()?;
            info!(
                anomaly_id = %anomaly_id,
                anomaly_type = %result.anomaly_type(),
                confidence = result.confidence(),
                observed = result.occurrence_count(),
                expected = result.expected_count(),
                "anomaly reported"
            );
            self.events.emit(WitnessEvent::AnomalyReported {
                anomaly_id,
                anomaly: result.payload(),
                reported_at,
            });
        }
        Ok(results)
    }

    // =========================================================================
    // Exclusions
    // =========================================================================

    /// Excludes `pair_key` from selection for `duration_hours`, replacing any
    /// existing exclusion of the same pair.
    ///
    /// # Errors
    ///
    /// Returns [`AnomalyError::Halted`] during a halt,
    /// [`AnomalyError::InvalidPairKey`] for a non-canonical key, and
    /// [`AnomalyError::InvalidDuration`] / [`AnomalyError::InvalidConfidence`]
    /// for out-of-range arguments.
    pub async fn exclude_pair(
        &self,
        pair_key: &str,
        duration_hours: i64,
        reason: &str,
        confidence: f64,
    ) -> Result<PairExclusion, AnomalyError> {
        if let Some(reason) = ports::halted(self.halt.as_ref()).await {
            warn!(pair_key, %reason, "exclusion rejected: system halted");
            return Err(AnomalyError::Halted { reason });
        }
        WitnessPair::from_canonical_key(pair_key)?;
        let duration = positive_hours(duration_hours)?;

        let exclusion =
            PairExclusion::new(pair_key, self.clock.now(), duration, reason, confidence)?;
        self.exclusions.put_exclusion(exclusion.clone()).await?;

        info!(
            pair_key,
            until = %exclusion.excluded_until,
            confidence,
            reason,
            "pair excluded"
        );
        self.events.emit(WitnessEvent::PairExcluded {
            pair_key: exclusion.pair_key.clone(),
            excluded_at: exclusion.excluded_at,
            excluded_until: exclusion.excluded_until,
            reason: exclusion.reason.clone(),
            confidence_bp: crate::canonical::to_basis_points(exclusion.confidence),
        });
        Ok(exclusion)
    }

    /// Lifts the exclusion of `pair_key`. Returns false if the pair was not
    /// (or no longer) excluded.
    ///
    /// # Errors
    ///
    /// Returns [`AnomalyError::Halted`] during a halt, or a store error.
    pub async fn clear_exclusion(&self, pair_key: &str) -> Result<bool, AnomalyError> {
        if let Some(reason) = ports::halted(self.halt.as_ref()).await {
            warn!(pair_key, %reason, "exclusion clearance rejected: system halted");
            return Err(AnomalyError::Halted { reason });
        }
        self.prune_expired().await?;
        let removed = self.exclusions.remove_exclusion(pair_key).await?;
        if removed {
            info!(pair_key, "pair exclusion cleared");
            self.events.emit(WitnessEvent::PairExclusionCleared {
                pair_key: pair_key.to_string(),
                cleared_at: self.clock.now(),
            });
        }
        Ok(removed)
    }

    /// Returns true while `pair_key` has an unexpired exclusion.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn is_excluded(&self, pair_key: &str) -> Result<bool, AnomalyError> {
        Ok(self.active_exclusion(pair_key).await?.is_some())
    }

    /// Returns the unexpired exclusion of `pair_key`, if any.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn get_exclusion(&self, pair_key: &str) -> Result<Option<PairExclusion>, AnomalyError> {
        Ok(self.active_exclusion(pair_key).await?)
    }

    /// Returns the keys of every unexpired exclusion.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn excluded_pairs(&self) -> Result<BTreeSet<String>, AnomalyError> {
        Ok(self.active_keys().await?)
    }

    async fn prune_expired(&self) -> Result<usize, StoreError> {
        let removed = self.exclusions.remove_expired(self.clock.now()).await?;
        if removed > 0 {
            debug!(removed, "pruned expired exclusions");
        }
        Ok(removed)
    }

    async fn active_exclusion(&self, pair_key: &str) -> Result<Option<PairExclusion>, StoreError> {
        self.prune_expired().await?;
        let now = self.clock.now();
        Ok(self
            .exclusions
            .get_exclusion(pair_key)
            .await?
            .filter(|exclusion| !exclusion.is_expired(now)))
    }

    async fn active_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        self.prune_expired().await?;
        let now = self.clock.now();
        Ok(self
            .exclusions
            .list_exclusions()
            .await?
            .into_iter()
            .filter(|exclusion| !exclusion.is_expired(now))
            .map(|exclusion| exclusion.pair_key)
            .collect())
    }
}

#[async_trait]
impl ExclusionGate for AnomalyDetector {
    async fn is_pair_blocked(&self, pair_key: &str) -> Result<bool, StoreError> {
        Ok(self.active_exclusion(pair_key).await?.is_some())
    }
}

#[async_trait]
impl ExcludedWitnessSource for AnomalyDetector {
    async fn excluded_witnesses(&self) -> Result<BTreeSet<WitnessId>, StoreError> {
        let keys = self.active_keys().await?;
        Ok(gate::members_of(keys.iter().map(String::as_str)))
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "occurrence counts are far below 2^52"
)]
fn to_f64(count: u64) -> f64 {
    count as f64
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::anomaly::MemoryActivityLog;
    use crate::clock::ManualClock;
    use crate::events::MemoryEventSink;
    use crate::ports::{HaltFlag, StaticWitnessPool};
    use crate::store::MemoryWitnessStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()
    }

    fn w(i: usize) -> WitnessId {
        WitnessId::new(format!("W{i:02}")).unwrap()
    }

    struct Fixture {
        log: Arc<MemoryActivityLog>,
        clock: Arc<ManualClock>,
        halt: Arc<HaltFlag>,
        sink: Arc<MemoryEventSink>,
        detector: AnomalyDetector,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(MemoryActivityLog::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let halt = Arc::new(HaltFlag::new());
        let sink = Arc::new(MemoryEventSink::new());
        let pool = Arc::new(StaticWitnessPool::new((0..15).map(w).collect()));
        let detector = AnomalyDetector::new(
            log.clone(),
            pool,
            Arc::new(MemoryWitnessStore::new()),
            halt.clone(),
            clock.clone(),
            sink.clone(),
        );
        Fixture {
            log,
            clock,
            halt,
            sink,
            detector,
        }
    }

    #[tokio::test]
    async fn co_occurrence_scan_classifies_and_orders() {
        let fx = fixture();
        let at = t0() - Duration::hours(1);
        for i in 0..10 {
            fx.log.record_event(format!("e{i}"), vec![w(1), w(0)], at);
        }
        fx.log.record_event("e10", vec![w(2), w(3)], at);

        let results = fx.detector.analyze_co_occurrence(24).await.unwrap();

        // M = 11, N = 15 -> expected 11/105 per pair.
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].anomaly_type(), AnomalyType::ExcessivePairing);
        assert_eq!(results[0].pair_key().as_deref(), Some("W00:W01"));
        assert_eq!(results[0].occurrence_count(), 10);
        assert!(results[0].confidence() > 0.99);

        assert_eq!(results[1].anomaly_type(), AnomalyType::CoOccurrence);
        assert_eq!(results[1].pair_key().as_deref(), Some("W02:W03"));
        assert!((results[1].confidence() - 0.7486).abs() < 1e-3);
        assert!((results[1].expected_count() - 11.0 / 105.0).abs() < 1e-9);

        assert_eq!(fx.sink.of_type("ANOMALY_REPORTED").len(), 2);
    }

    #[tokio::test]
    async fn co_occurrence_ignores_events_outside_window() {
        let fx = fixture();
        for i in 0..10 {
            fx.log
                .record_event(format!("old{i}"), vec![w(0), w(1)], t0() - Duration::hours(30));
        }
        assert!(fx.detector.analyze_co_occurrence(24).await.unwrap().is_empty());
        assert_eq!(fx.detector.analyze_co_occurrence(48).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailability_scan_reports_outlier_only() {
        let fx = fixture();
        let at = t0() - Duration::hours(2);
        for _ in 0..8 {
            fx.log.record_unavailability(w(5), at, "timeout");
        }
        fx.log.record_unavailability(w(6), at, "timeout");
        fx.log.record_unavailability(w(7), at, "refused");

        let results = fx.detector.analyze_unavailability(24).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].anomaly_type(), AnomalyType::UnavailabilityPattern);
        assert_eq!(results[0].affected_witnesses(), &[w(5)]);
        assert!(results[0].pair_key().is_none());
    }

    #[tokio::test]
    async fn scan_rejects_non_positive_window() {
        let fx = fixture();
        let err = fx.detector.analyze_co_occurrence(0).await.unwrap_err();
        assert!(matches!(err, AnomalyError::InvalidDuration { hours: 0 }));
    }

    #[tokio::test]
    async fn exclusion_expires_after_duration() {
        let fx = fixture();
        fx.detector
            .exclude_pair("W00:W01", 24, "co-occurrence", 0.9)
            .await
            .unwrap();
        assert!(fx.detector.is_excluded("W00:W01").await.unwrap());

        fx.clock.advance(Duration::hours(23));
        assert!(fx.detector.is_pair_blocked("W00:W01").await.unwrap());

        fx.clock.advance(Duration::hours(1));
        assert!(!fx.detector.is_excluded("W00:W01").await.unwrap());
        assert!(fx.detector.get_exclusion("W00:W01").await.unwrap().is_none());
        assert!(fx.detector.excluded_pairs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_exclusion_reports_presence() {
        let fx = fixture();
        fx.detector
            .exclude_pair("W00:W01", 48, "manual", 1.0)
            .await
            .unwrap();
        assert!(fx.detector.clear_exclusion("W00:W01").await.unwrap());
        assert!(!fx.detector.clear_exclusion("W00:W01").await.unwrap());
        assert_eq!(fx.sink.of_type("PAIR_EXCLUDED").len(), 1);
        assert_eq!(fx.sink.of_type("PAIR_EXCLUSION_CLEARED").len(), 1);
    }

    #[tokio::test]
    async fn exclude_rejects_bad_arguments() {
        let fx = fixture();
        assert!(matches!(
            fx.detector.exclude_pair("W01:W00", 24, "", 0.5).await,
            Err(AnomalyError::InvalidPairKey(_))
        ));
        assert!(matches!(
            fx.detector.exclude_pair("W00:W01", -1, "", 0.5).await,
            Err(AnomalyError::InvalidDuration { hours: -1 })
        ));
        assert!(matches!(
            fx.detector.exclude_pair("W00:W01", 24, "", 1.5).await,
            Err(AnomalyError::InvalidConfidence { .. })
        ));
        assert!(fx.detector.excluded_pairs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn halt_blocks_writes_but_not_reads() {
        let fx = fixture();
        fx.detector
            .exclude_pair("W00:W01", 24, "before halt", 0.8)
            .await
            .unwrap();
        fx.halt.halt("ledger fork");

        let err = fx
            .detector
            .exclude_pair("W02:W03", 24, "during halt", 0.8)
            .await
            .unwrap_err();
        assert!(matches!(err, AnomalyError::Halted { reason } if reason == "ledger fork"));
        assert!(matches!(
            fx.detector.clear_exclusion("W00:W01").await,
            Err(AnomalyError::Halted { .. })
        ));

        assert!(fx.detector.is_excluded("W00:W01").await.unwrap());
        assert!(!fx.detector.is_excluded("W02:W03").await.unwrap());
    }

    #[tokio::test]
    async fn excluded_witnesses_are_pair_members() {
        let fx = fixture();
        fx.detector.exclude_pair("W00:W01", 24, "", 0.9).await.unwrap();
        fx.detector.exclude_pair("W01:W02", 24, "", 0.9).await.unwrap();

        let excluded = fx.detector.excluded_witnesses().await.unwrap();
        assert_eq!(excluded, BTreeSet::from([w(0), w(1), w(2)]));
    }
}
