//! Periodic collusion sweep.
//!
//! A sweep ties the detector and the investigator together:
//!
//! 1. run the co-occurrence and unavailability scans over the configured
//!    window,
//! 2. exclude every anomalous pair for the configured duration,
//! 3. score each anomalous pair against the breaches recorded in the same
//!    window and open an investigation where the score warrants one.
//!
//! Unavailability findings concern single witnesses and are reported only.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::anomaly::{
    AnomalyDetector, AnomalyError, AnomalyResult, PairExclusion, positive_hours,
};
use crate::clock::Clock;
use crate::investigation::{BreachSource, CollusionInvestigator, InvestigationError};
use crate::ports::CollaboratorError;
use crate::types::WitnessPair;

/// Errors that abort a sweep.
///
/// Exclusions and investigations placed before the failure stay in place.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SweepError {
    /// A scan or exclusion failed.
    #[error(transparent)]
    Anomaly(#[from] AnomalyError),

    /// Correlation or investigation placement failed.
    #[error(transparent)]
    Investigation(#[from] InvestigationError),

    /// Breaches could not be read.
    #[error(transparent)]
    Source(#[from] CollaboratorError),
}

/// An investigation opened (or found already open) by a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredInvestigation {
    /// Investigation id.
    pub investigation_id: String,
    /// Suspended pair.
    pub pair_key: String,
    /// Breach correlation that warranted the investigation.
    pub correlation: f64,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Pair findings, highest confidence first.
    pub co_occurrence: Vec<AnomalyResult>,
    /// Witness unavailability findings, highest confidence first.
    pub unavailability: Vec<AnomalyResult>,
    /// Exclusions placed, one per anomalous pair.
    pub exclusions: Vec<PairExclusion>,
    /// Investigations opened for pairs whose correlation warranted one.
    pub investigations: Vec<TriggeredInvestigation>,
}

/// Runs detector scans and escalates their findings.
pub struct CollusionSweep {
    detector: Arc<AnomalyDetector>,
    investigator: Arc<CollusionInvestigator>,
    breaches: Arc<dyn BreachSource>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CollusionSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollusionSweep")
            .field("detector", &self.detector)
            .field("investigator", &self.investigator)
            .finish_non_exhaustive()
    }
}

impl CollusionSweep {
    /// Creates a sweep. Window and exclusion durations come from the
    /// detector's policy.
    #[must_use]
    pub fn new(
        detector: Arc<AnomalyDetector>,
        investigator: Arc<CollusionInvestigator>,
        breaches: Arc<dyn BreachSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            detector,
            investigator,
            breaches,
            clock,
        }
    }

    /// Runs one sweep.
    ///
    /// # Errors
    ///
    /// Returns the first scan, exclusion, breach or investigation failure.
    /// During a halt the scans succeed and the first exclusion fails with
    /// [`AnomalyError::Halted`].
    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let policy = *self.detector.policy();
        let window_hours = policy.scan_window_hours;

        let co_occurrence = self.detector.analyze_co_occurrence(window_hours).await?;
        let unavailability = self.detector.analyze_unavailability(window_hours).await?;

        // A pair named by several findings is excluded once, at the highest
        // confidence.
        let mut by_pair: BTreeMap<String, Vec<&AnomalyResult>> = BTreeMap::new();
        for result in &co_occurrence {
            if let Some(key) = result.pair_key() {
                by_pair.entry(key).or_default().push(result);
            }
        }

        let since = self
            .clock
            .now()
            .checked_sub_signed(positive_hours(window_hours)?)
            .ok_or(AnomalyError::InvalidDuration {
                hours: window_hours,
            })?;
        let breach_ids: Vec<String> = self
            .breaches
            .breaches_since(since)
            .await?
            .into_iter()
            .map(|breach| breach.breach_id)
            .collect();

        let mut report = SweepReport {
            co_occurrence: co_occurrence.clone(),
            unavailability,
            ..SweepReport::default()
        };

        for (pair_key, findings) in by_pair {
            let confidence = findings
                .iter()
                .map(|f| f.confidence())
                .fold(0.0_f64, f64::max);
            let reason = findings
                .iter()
                .map(|f| f.anomaly_type().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let exclusion = self
                .detector
                .exclude_pair(&pair_key, policy.exclusion_hours, &reason, confidence)
                .await?;
            report.exclusions.push(exclusion);

            let pair = WitnessPair::from_canonical_key(&pair_key).map_err(AnomalyError::from)?;
            let correlation = self.investigator.correlation(&pair, &breach_ids).await?;
            if !self.investigator.trigger_warranted(correlation) {
                debug!(pair_key = %pair_key, correlation, "correlation below trigger threshold");
                continue;
            }

            let anomaly_ids = findings
                .iter()
                .map(|f| f.anomaly_id())
                .collect::<Result<Vec<_>, _>>()
                .map_err(AnomalyError::from)?;
            let investigation_id = self
                .investigator
                .trigger(&pair_key, anomaly_ids, breach_ids.clone())
                .await?;
            report.investigations.push(TriggeredInvestigation {
                investigation_id,
                pair_key,
                correlation,
            });
        }

        info!(
            window_hours,
            co_occurrence = report.co_occurrence.len(),
            unavailability = report.unavailability.len(),
            exclusions = report.exclusions.len(),
            investigations = report.investigations.len(),
            "collusion sweep complete"
        );
        Ok(report)
    }
}
