//! Witness policy configuration.
//!
//! Every threshold the core applies lives in [`WitnessPolicyConfig`]. The
//! defaults reproduce the built-in constants, so an empty TOML document is a
//! valid configuration.
//!
//! ```toml
//! [selection]
//! standard_minimum = 6
//! high_stakes_minimum = 12
//!
//! [rotation]
//! window_hours = 24
//!
//! [anomaly]
//! report_threshold = 0.7
//! exclusion_hours = 168
//!
//! [investigation]
//! correlation_threshold = 0.8
//! ```

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Top-level witness policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WitnessPolicyConfig {
    /// Pool-size minimums.
    #[serde(default)]
    pub selection: SelectionPolicy,

    /// Pair rotation window.
    #[serde(default)]
    pub rotation: RotationPolicy,

    /// Anomaly scan thresholds.
    #[serde(default)]
    pub anomaly: AnomalyPolicy,

    /// Investigation trigger policy.
    #[serde(default)]
    pub investigation: InvestigationPolicy,
}

impl WitnessPolicyConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let selection = &self.selection;
        if selection.standard_minimum < 2 {
            return Err(ConfigError::Validation(format!(
                "selection.standard_minimum must be at least 2, got {}",
                selection.standard_minimum
            )));
        }
        if selection.high_stakes_minimum < selection.standard_minimum {
            return Err(ConfigError::Validation(format!(
                "selection.high_stakes_minimum ({}) must not be below standard_minimum ({})",
                selection.high_stakes_minimum, selection.standard_minimum
            )));
        }
        positive_hours("rotation.window_hours", self.rotation.window_hours)?;
        positive_hours("anomaly.exclusion_hours", self.anomaly.exclusion_hours)?;
        positive_hours("anomaly.scan_window_hours", self.anomaly.scan_window_hours)?;
        unit_interval("anomaly.report_threshold", self.anomaly.report_threshold)?;
        unit_interval(
            "investigation.correlation_threshold",
            self.investigation.correlation_threshold,
        )?;
        let ratio = self.anomaly.excessive_pairing_ratio;
        if ratio.is_nan() || ratio < 1.0 {
            return Err(ConfigError::Validation(format!(
                "anomaly.excessive_pairing_ratio must be at least 1.0, got {ratio}"
            )));
        }
        Ok(())
    }
}

fn positive_hours(field: &str, hours: i64) -> Result<(), ConfigError> {
    if hours <= 0 {
        return Err(ConfigError::Validation(format!(
            "{field} must be positive, got {hours}"
        )));
    }
    if Duration::try_hours(hours).is_none() {
        return Err(ConfigError::Validation(format!(
            "{field} is too large to represent as a duration, got {hours}"
        )));
    }
    Ok(())
}

fn unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Validation(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

/// Pool-size minimums for selection and pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionPolicy {
    /// Minimum pool for standard operations.
    #[serde(default = "default_standard_minimum")]
    pub standard_minimum: usize,

    /// Minimum pool for high-stakes operations. Below this the pool is
    /// degraded.
    #[serde(default = "default_high_stakes_minimum")]
    pub high_stakes_minimum: usize,
}

const fn default_standard_minimum() -> usize {
    6
}

const fn default_high_stakes_minimum() -> usize {
    12
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            standard_minimum: default_standard_minimum(),
            high_stakes_minimum: default_high_stakes_minimum(),
        }
    }
}

impl SelectionPolicy {
    /// Returns the minimum for the given operation class.
    #[must_use]
    pub const fn required(&self, high_stakes: bool) -> usize {
        if high_stakes {
            self.high_stakes_minimum
        } else {
            self.standard_minimum
        }
    }
}

/// Pair rotation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotationPolicy {
    /// Hours during which a recorded pair may not recur.
    #[serde(default = "default_rotation_window_hours")]
    pub window_hours: i64,
}

const fn default_rotation_window_hours() -> i64 {
    24
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            window_hours: default_rotation_window_hours(),
        }
    }
}

impl RotationPolicy {
    /// Returns the window as a duration.
    ///
    /// Hours beyond what a [`Duration`] can hold saturate to
    /// [`Duration::MAX`]; [`WitnessPolicyConfig::validate`] rejects them.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::try_hours(self.window_hours).unwrap_or(Duration::MAX)
    }
}

/// Anomaly scan thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnomalyPolicy {
    /// Minimum confidence for a scan to report a finding.
    #[serde(default = "default_report_threshold")]
    pub report_threshold: f64,

    /// Observed/expected ratio at which co-occurrence is classed as
    /// excessive pairing.
    #[serde(default = "default_excessive_pairing_ratio")]
    pub excessive_pairing_ratio: f64,

    /// Minimum observed count for excessive pairing.
    #[serde(default = "default_excessive_pairing_min_count")]
    pub excessive_pairing_min_count: u64,

    /// Duration of exclusions placed by a collusion sweep.
    #[serde(default = "default_exclusion_hours")]
    pub exclusion_hours: i64,

    /// Lookback window for a collusion sweep.
    #[serde(default = "default_scan_window_hours")]
    pub scan_window_hours: i64,
}

const fn default_report_threshold() -> f64 {
    0.7
}

const fn default_excessive_pairing_ratio() -> f64 {
    3.0
}

const fn default_excessive_pairing_min_count() -> u64 {
    3
}

const fn default_exclusion_hours() -> i64 {
    168
}

const fn default_scan_window_hours() -> i64 {
    168
}

impl Default for AnomalyPolicy {
    fn default() -> Self {
        Self {
            report_threshold: default_report_threshold(),
            excessive_pairing_ratio: default_excessive_pairing_ratio(),
            excessive_pairing_min_count: default_excessive_pairing_min_count(),
            exclusion_hours: default_exclusion_hours(),
            scan_window_hours: default_scan_window_hours(),
        }
    }
}

/// Investigation trigger policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvestigationPolicy {
    /// Correlation strictly above which an investigation is warranted.
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,
}

const fn default_correlation_threshold() -> f64 {
    0.8
}

impl Default for InvestigationPolicy {
    fn default() -> Self {
        Self {
            correlation_threshold: default_correlation_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = WitnessPolicyConfig::from_toml("").unwrap();
        assert_eq!(config, WitnessPolicyConfig::default());
        assert_eq!(config.selection.required(false), 6);
        assert_eq!(config.selection.required(true), 12);
        assert_eq!(config.rotation.window(), Duration::hours(24));
        assert_eq!(config.anomaly.exclusion_hours, 168);
    }

    #[test]
    fn partial_override() {
        let config = WitnessPolicyConfig::from_toml(
            r"
            [selection]
            high_stakes_minimum = 20

            [investigation]
            correlation_threshold = 0.9
            ",
        )
        .unwrap();
        assert_eq!(config.selection.standard_minimum, 6);
        assert_eq!(config.selection.high_stakes_minimum, 20);
        assert!((config.investigation.correlation_threshold - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn high_stakes_below_standard_rejected() {
        let err = WitnessPolicyConfig::from_toml(
            r"
            [selection]
            standard_minimum = 8
            high_stakes_minimum = 7
            ",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("high_stakes_minimum")));
    }

    #[test]
    fn threshold_outside_unit_interval_rejected() {
        let err = WitnessPolicyConfig::from_toml("[anomaly]\nreport_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn non_positive_window_rejected() {
        let err = WitnessPolicyConfig::from_toml("[rotation]\nwindow_hours = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("rotation.window_hours")));
    }

    #[test]
    fn unrepresentable_hours_rejected() {
        for (section, field) in [
            ("rotation", "window_hours"),
            ("anomaly", "exclusion_hours"),
            ("anomaly", "scan_window_hours"),
        ] {
            let text = format!("[{section}]\n{field} = {}\n", i64::MAX);
            let err = WitnessPolicyConfig::from_toml(&text).unwrap_err();
            assert!(
                matches!(&err, ConfigError::Validation(msg) if msg.contains(field)),
                "{section}.{field}: {err}"
            );
        }
    }

    #[test]
    fn oversized_window_saturates_instead_of_panicking() {
        let rotation = RotationPolicy {
            window_hours: i64::MAX,
        };
        assert_eq!(rotation.window(), Duration::MAX);
    }

    #[test]
    fn unknown_field_rejected() {
        let err = WitnessPolicyConfig::from_toml("[selection]\nminimum = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn toml_roundtrip_and_file_load() {
        let config = WitnessPolicyConfig::default();
        let text = config.to_toml().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        let loaded = WitnessPolicyConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
