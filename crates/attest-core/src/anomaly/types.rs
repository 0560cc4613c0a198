//! Anomaly findings and time-boxed pair exclusions.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use sha2::{Digest, Sha256};

use super::error::AnomalyError;
use crate::canonical::{self, CanonicalError};
use crate::types::WitnessId;

/// Classification of a statistical finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyType {
    /// A pair appears together more often than independent selection
    /// explains.
    CoOccurrence,
    /// A witness is unavailable disproportionately often.
    UnavailabilityPattern,
    /// A pair appears together at several times the expected rate.
    ExcessivePairing,
}

impl AnomalyType {
    /// Returns the stable code for this type.
    #[must_use]
    pub const fn as_code(&self) -> &'static str {
        match self {
            Self::CoOccurrence => "CO_OCCURRENCE",
            Self::UnavailabilityPattern => "UNAVAILABILITY_PATTERN",
            Self::ExcessivePairing => "EXCESSIVE_PAIRING",
        }
    }

    /// Returns true for findings about a witness pair (as opposed to a
    /// single witness).
    #[must_use]
    pub const fn is_pair_finding(&self) -> bool {
        matches!(self, Self::CoOccurrence | Self::ExcessivePairing)
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// A statistical finding produced by a scan.
///
/// Confidence is guaranteed to lie in `[0, 1]`; the constructor and
/// deserialization reject anything else.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyResult {
    anomaly_type: AnomalyType,
    confidence: f64,
    affected_witnesses: Vec<WitnessId>,
    occurrence_count: u64,
    expected_count: f64,
    details: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AnomalyResultRaw {
    anomaly_type: AnomalyType,
    confidence: f64,
    affected_witnesses: Vec<WitnessId>,
    occurrence_count: u64,
    expected_count: f64,
    details: String,
}

impl<'de> Deserialize<'de> for AnomalyResult {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = AnomalyResultRaw::deserialize(deserializer)?;
        Self::new(
            raw.anomaly_type,
            raw.confidence,
            raw.affected_witnesses,
            raw.occurrence_count,
            raw.expected_count,
            raw.details,
        )
        .map_err(de::Error::custom)
    }
}

impl AnomalyResult {
    /// Creates a finding. `affected_witnesses` is stored sorted.
    ///
    /// # Errors
    ///
    /// Returns [`AnomalyError::InvalidConfidence`] if `confidence` is NaN or
    /// outside `[0, 1]`.
    pub fn new(
        anomaly_type: AnomalyType,
        confidence: f64,
        mut affected_witnesses: Vec<WitnessId>,
        occurrence_count: u64,
        expected_count: f64,
        details: impl Into<String>,
    ) -> Result<Self, AnomalyError> {
        validate_confidence(confidence)?;
        affected_witnesses.sort();
        affected_witnesses.dedup();
        Ok(Self {
            anomaly_type,
            confidence,
            affected_witnesses,
            occurrence_count,
            expected_count,
            details: details.into(),
        })
    }

    /// Returns the finding's type.
    #[must_use]
    pub const fn anomaly_type(&self) -> AnomalyType {
        self.anomaly_type
    }

    /// Returns the confidence in `[0, 1]`.
    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Returns the affected witnesses, sorted.
    #[must_use]
    pub fn affected_witnesses(&self) -> &[WitnessId] {
        &self.affected_witnesses
    }

    /// Returns the observed count.
    #[must_use]
    pub const fn occurrence_count(&self) -> u64 {
        self.occurrence_count
    }

    /// Returns the count expected under independent selection.
    #[must_use]
    pub const fn expected_count(&self) -> f64 {
        self.expected_count
    }

    /// Returns the human-readable details.
    #[must_use]
    pub fn details(&self) -> &str {
        &self.details
    }

    /// Returns the canonical pair key when this is a pair finding.
    #[must_use]
    pub fn pair_key(&self) -> Option<String> {
        if !self.anomaly_type.is_pair_finding() {
            return None;
        }
        match self.affected_witnesses.as_slice() {
            [a, b] => Some(crate::types::canonical_key(a, b)),
            _ => None,
        }
    }

    /// Returns the integer-only payload used for witnessing and ids.
    #[must_use]
    pub fn payload(&self) -> AnomalyPayload {
        AnomalyPayload {
            anomaly_type: self.anomaly_type,
            confidence_bp: canonical::to_basis_points(self.confidence),
            affected_witnesses: self.affected_witnesses.clone(),
            occurrence_count: self.occurrence_count,
            expected_count_milli: to_milli(self.expected_count),
            details: self.details.clone(),
        }
    }

    /// Returns a content-derived identifier (hex SHA-256 of the canonical
    /// payload). Identical findings from different scans share an id.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError`] if the payload cannot be rendered.
    pub fn anomaly_id(&self) -> Result<String, CanonicalError> {
        let bytes = canonical::to_canonical_bytes(&self.payload())?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Integer-only rendering of an [`AnomalyResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyPayload {
    /// Finding type.
    pub anomaly_type: AnomalyType,
    /// Confidence in basis points.
    pub confidence_bp: u32,
    /// Affected witnesses, sorted.
    pub affected_witnesses: Vec<WitnessId>,
    /// Observed count.
    pub occurrence_count: u64,
    /// Expected count in thousandths.
    pub expected_count_milli: u64,
    /// Human-readable details.
    pub details: String,
}

/// A time-boxed exclusion of a witness pair from selection.
///
/// Deserialization applies the same checks as [`PairExclusion::new`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairExclusion {
    /// Canonical pair key.
    pub pair_key: String,
    /// When the exclusion was placed.
    pub excluded_at: DateTime<Utc>,
    /// When the exclusion lapses.
    pub excluded_until: DateTime<Utc>,
    /// Why the pair was excluded.
    pub reason: String,
    /// Confidence of the finding behind the exclusion.
    pub confidence: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PairExclusionRaw {
    pair_key: String,
    excluded_at: DateTime<Utc>,
    excluded_until: DateTime<Utc>,
    reason: String,
    confidence: f64,
}

impl<'de> Deserialize<'de> for PairExclusion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = PairExclusionRaw::deserialize(deserializer)?;
        Self::new(
            raw.pair_key,
            raw.excluded_at,
            raw.excluded_until - raw.excluded_at,
            raw.reason,
            raw.confidence,
        )
        .map_err(de::Error::custom)
    }
}

impl PairExclusion {
    /// Creates an exclusion lasting `duration` from `excluded_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AnomalyError::InvalidDuration`] if `duration` is not
    /// positive or overflows the calendar, and
    /// [`AnomalyError::InvalidConfidence`] if `confidence` is outside
    /// `[0, 1]`.
    pub fn new(
        pair_key: impl Into<String>,
        excluded_at: DateTime<Utc>,
        duration: Duration,
        reason: impl Into<String>,
        confidence: f64,
    ) -> Result<Self, AnomalyError> {
        if duration <= Duration::zero() {
            return Err(AnomalyError::InvalidDuration {
                hours: duration.num_hours(),
            });
        }
        validate_confidence(confidence)?;
        let excluded_until = excluded_at.checked_add_signed(duration).ok_or(
            AnomalyError::InvalidDuration {
                hours: duration.num_hours(),
            },
        )?;
        Ok(Self {
            pair_key: pair_key.into(),
            excluded_at,
            excluded_until,
            reason: reason.into(),
            confidence,
        })
    }

    /// Returns true once `now` has reached `excluded_until`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.excluded_until
    }

    /// Returns the time left before the exclusion lapses.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            Some(self.excluded_until - now)
        }
    }
}

pub(crate) fn validate_confidence(confidence: f64) -> Result<(), AnomalyError> {
    if confidence.is_nan() || !(0.0..=1.0).contains(&confidence) {
        return Err(AnomalyError::InvalidConfidence {
            value: confidence.to_string(),
        });
    }
    Ok(())
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    reason = "negative and NaN inputs are mapped to zero before the cast"
)]
fn to_milli(value: f64) -> u64 {
    if value.is_nan() || value <= 0.0 {
        return 0;
    }
    (value * 1000.0).round().min(i64::MAX as f64) as u64
}
