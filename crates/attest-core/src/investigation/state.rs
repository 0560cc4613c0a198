//! Investigation lifecycle: `ACTIVE -> {CLEARED, CONFIRMED}`.
//!
//! An [`Investigation`] is created `ACTIVE` and transitions exactly once to a
//! terminal status. Transitions never mutate in place: [`Investigation::resolved`]
//! returns a new value and refuses to resolve a terminal investigation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::InvestigationError;
use crate::canonical;

/// Status of an investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestigationStatus {
    /// Under investigation; the pair is suspended.
    Active,
    /// Closed without finding collusion.
    Cleared,
    /// Collusion confirmed; the pair is permanently banned.
    Confirmed,
}

impl InvestigationStatus {
    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Cleared => "CLEARED",
            Self::Confirmed => "CONFIRMED",
        }
    }

    /// Returns true for `CLEARED` and `CONFIRMED`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvestigationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "CLEARED" => Ok(Self::Cleared),
            "CONFIRMED" => Ok(Self::Confirmed),
            other => Err(format!("unknown investigation status: {other}")),
        }
    }
}

/// Outcome chosen when resolving an investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// No collusion; lift the suspension.
    Cleared,
    /// Collusion confirmed; ban the pair permanently.
    Confirmed,
}

impl Resolution {
    /// Returns the terminal status this resolution produces.
    #[must_use]
    pub const fn status(&self) -> InvestigationStatus {
        match self {
            Self::Cleared => InvestigationStatus::Cleared,
            Self::Confirmed => InvestigationStatus::Confirmed,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status().as_str())
    }
}

/// A collusion investigation into one witness pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investigation {
    pub(crate) id: String,
    pub(crate) pair_key: String,
    pub(crate) status: InvestigationStatus,
    pub(crate) triggered_at: DateTime<Utc>,
    pub(crate) triggering_anomaly_ids: Vec<String>,
    pub(crate) breach_ids: Vec<String>,
    pub(crate) correlation_score: f64,
    pub(crate) resolved_at: Option<DateTime<Utc>>,
    pub(crate) resolution: Option<Resolution>,
    pub(crate) resolved_by: Option<String>,
    pub(crate) reason: Option<String>,
}

impl Investigation {
    /// Opens a new `ACTIVE` investigation. The correlation score is clamped
    /// to `[0, 1]` (`NaN` becomes 0).
    #[must_use]
    pub fn open(
        id: impl Into<String>,
        pair_key: impl Into<String>,
        triggered_at: DateTime<Utc>,
        triggering_anomaly_ids: Vec<String>,
        breach_ids: Vec<String>,
        correlation_score: f64,
    ) -> Self {
        let correlation_score = if correlation_score.is_nan() {
            0.0
        } else {
            correlation_score.clamp(0.0, 1.0)
        };
        Self {
            id: id.into(),
            pair_key: pair_key.into(),
            status: InvestigationStatus::Active,
            triggered_at,
            triggering_anomaly_ids,
            breach_ids,
            correlation_score,
            resolved_at: None,
            resolution: None,
            resolved_by: None,
            reason: None,
        }
    }

    /// Returns the resolved form of this investigation.
    ///
    /// # Errors
    ///
    /// Returns [`InvestigationError::InvestigationAlreadyResolved`] if the
    /// investigation is already terminal, whatever `resolution` is.
    pub fn resolved(
        &self,
        resolution: Resolution,
        reason: impl Into<String>,
        resolved_by: impl Into<String>,
        resolved_at: DateTime<Utc>,
    ) -> Result<Self, InvestigationError> {
        if self.status.is_terminal() {
            return Err(InvestigationError::InvestigationAlreadyResolved {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(Self {
            status: resolution.status(),
            resolved_at: Some(resolved_at),
            resolution: Some(resolution),
            resolved_by: Some(resolved_by.into()),
            reason: Some(reason.into()),
            ..self.clone()
        })
    }

    /// Investigation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical key of the investigated pair.
    #[must_use]
    pub fn pair_key(&self) -> &str {
        &self.pair_key
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> InvestigationStatus {
        self.status
    }

    /// Returns true while the investigation is `ACTIVE`.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, InvestigationStatus::Active)
    }

    /// When the investigation was opened.
    #[must_use]
    pub const fn triggered_at(&self) -> DateTime<Utc> {
        self.triggered_at
    }

    /// Ids of the anomalies that prompted the investigation.
    #[must_use]
    pub fn triggering_anomaly_ids(&self) -> &[String] {
        &self.triggering_anomaly_ids
    }

    /// Ids of the breaches considered when opening the investigation.
    #[must_use]
    pub fn breach_ids(&self) -> &[String] {
        &self.breach_ids
    }

    /// Breach correlation in `[0, 1]` at trigger time.
    #[must_use]
    pub const fn correlation_score(&self) -> f64 {
        self.correlation_score
    }

    /// When the investigation was resolved.
    #[must_use]
    pub const fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }

    /// The chosen resolution.
    #[must_use]
    pub const fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    /// Who resolved the investigation.
    #[must_use]
    pub fn resolved_by(&self) -> Option<&str> {
        self.resolved_by.as_deref()
    }

    /// Why it was resolved that way.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Integer-only view for witnessing.
    #[must_use]
    pub fn payload(&self) -> InvestigationPayload {
        InvestigationPayload {
            id: self.id.clone(),
            pair_key: self.pair_key.clone(),
            status: self.status,
            triggered_at: self.triggered_at,
            triggering_anomaly_ids: self.triggering_anomaly_ids.clone(),
            breach_ids: self.breach_ids.clone(),
            correlation_bp: canonical::to_basis_points(self.correlation_score),
            resolved_at: self.resolved_at,
            resolution: self.resolution,
            resolved_by: self.resolved_by.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Integer-only rendering of an [`Investigation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationPayload {
    /// Investigation id.
    pub id: String,
    /// Canonical pair key.
    pub pair_key: String,
    /// Status.
    pub status: InvestigationStatus,
    /// Trigger time.
    pub triggered_at: DateTime<Utc>,
    /// Triggering anomaly ids.
    pub triggering_anomaly_ids: Vec<String>,
    /// Considered breach ids.
    pub breach_ids: Vec<String>,
    /// Correlation in basis points.
    pub correlation_bp: u32,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Resolution.
    pub resolution: Option<Resolution>,
    /// Resolver.
    pub resolved_by: Option<String>,
    /// Resolution reason.
    pub reason: Option<String>,
}
