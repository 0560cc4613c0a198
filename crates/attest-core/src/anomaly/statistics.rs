//! Chi-square scoring for witness co-occurrence and unavailability.
//!
//! All functions here are pure. Each compares a single observed count against
//! the count expected under independent uniform selection, using one degree of
//! freedom. The resulting chi-square value is mapped to a confidence in
//! `[0, 1]` through the critical values for p = 0.05, 0.01 and 0.001.

/// Chi-square critical value for p = 0.05 (1 degree of freedom).
pub const CHI_SQUARE_P05: f64 = 3.84;

/// Chi-square critical value for p = 0.01 (1 degree of freedom).
pub const CHI_SQUARE_P01: f64 = 6.63;

/// Chi-square critical value for p = 0.001 (1 degree of freedom).
pub const CHI_SQUARE_P001: f64 = 10.83;

/// Confidence assigned at [`CHI_SQUARE_P05`].
pub const CONFIDENCE_AT_P05: f64 = 0.5;

/// Confidence assigned at [`CHI_SQUARE_P01`].
pub const CONFIDENCE_AT_P01: f64 = 0.7;

/// Confidence assigned at [`CHI_SQUARE_P001`].
pub const CONFIDENCE_AT_P001: f64 = 0.9;

/// Expected number of times any particular pair co-occurs when
/// `total_events` witnessed events draw pairs uniformly from a pool of
/// `pool_size` witnesses.
///
/// Returns 0 for pools with fewer than two witnesses.
#[must_use]
#[expect(
    clippy::cast_precision_loss,
    reason = "event and pool counts are far below 2^52"
)]
pub fn expected_pair_count(total_events: u64, pool_size: usize) -> f64 {
    if pool_size < 2 {
        return 0.0;
    }
    let n = pool_size as f64;
    let possible_pairs = n * (n - 1.0) / 2.0;
    total_events as f64 / possible_pairs
}

/// Expected per-witness share of `total` occurrences spread uniformly over
/// `pool_size` witnesses. Returns 0 for an empty pool.
#[must_use]
#[expect(
    clippy::cast_precision_loss,
    reason = "event and pool counts are far below 2^52"
)]
pub fn expected_share(total: u64, pool_size: usize) -> f64 {
    if pool_size == 0 {
        return 0.0;
    }
    total as f64 / pool_size as f64
}

/// Single-cell chi-square statistic `(observed - expected)² / expected`.
///
/// Returns `+∞` when nothing was expected but something was observed, and 0
/// when both are zero.
#[must_use]
pub fn chi_square(observed: f64, expected: f64) -> f64 {
    if expected <= 0.0 {
        return if observed > 0.0 { f64::INFINITY } else { 0.0 };
    }
    let diff = observed - expected;
    diff * diff / expected
}

/// Maps a chi-square value to a confidence in `[0, 1]`.
///
/// Piecewise linear through `(0, 0)`, `(3.84, 0.5)`, `(6.63, 0.7)` and
/// `(10.83, 0.9)`; beyond the last point the confidence approaches 1.0
/// exponentially. The mapping is monotonic non-decreasing. `NaN` maps to 0.
#[must_use]
pub fn chi_square_confidence(chi_sq: f64) -> f64 {
    if chi_sq.is_nan() || chi_sq <= 0.0 {
        return 0.0;
    }
    let confidence = if chi_sq < CHI_SQUARE_P05 {
        (CONFIDENCE_AT_P05 * chi_sq / CHI_SQUARE_P05).min(CONFIDENCE_AT_P05)
    } else if chi_sq < CHI_SQUARE_P01 {
        interpolate(
            chi_sq,
            (CHI_SQUARE_P05, CONFIDENCE_AT_P05),
            (CHI_SQUARE_P01, CONFIDENCE_AT_P01),
        )
    } else if chi_sq < CHI_SQUARE_P001 {
        interpolate(
            chi_sq,
            (CHI_SQUARE_P01, CONFIDENCE_AT_P01),
            (CHI_SQUARE_P001, CONFIDENCE_AT_P001),
        )
    } else {
        let tail = 1.0 - CONFIDENCE_AT_P001;
        1.0 - tail * (-(chi_sq - CHI_SQUARE_P001) / CHI_SQUARE_P001).exp()
    };
    confidence.clamp(0.0, 1.0)
}

/// Convenience: confidence that `observed` exceeds `expected` by more than
/// chance. Returns 0 when `observed <= expected`, since only
/// over-representation is suspicious.
#[must_use]
pub fn excess_confidence(observed: f64, expected: f64) -> f64 {
    if observed <= expected {
        return 0.0;
    }
    chi_square_confidence(chi_square(observed, expected))
}

// Capped at y1 so rounding never lets a segment overshoot the next one.
fn interpolate(x: f64, (x0, y0): (f64, f64), (x1, y1): (f64, f64)) -> f64 {
    (y0 + (y1 - y0) * (x - x0) / (x1 - x0)).min(y1)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn expected_pair_count_uses_pair_combinations() {
        // 15 witnesses -> 105 pairs
        assert!((expected_pair_count(210, 15) - 2.0).abs() < EPS);
        assert!((expected_pair_count(1, 2) - 1.0).abs() < EPS);
    }

    #[test]
    fn expected_pair_count_zero_for_tiny_pools() {
        assert!(expected_pair_count(100, 0).abs() < EPS);
        assert!(expected_pair_count(100, 1).abs() < EPS);
    }

    #[test]
    fn expected_share_divides_evenly() {
        assert!((expected_share(30, 15) - 2.0).abs() < EPS);
        assert!(expected_share(30, 0).abs() < EPS);
    }

    #[test]
    fn chi_square_edge_cases() {
        assert!(chi_square(5.0, 0.0).is_infinite());
        assert!(chi_square(0.0, 0.0).abs() < EPS);
        assert!((chi_square(10.0, 5.0) - 5.0).abs() < EPS);
        assert!((chi_square(0.0, 4.0) - 4.0).abs() < EPS);
    }

    #[test]
    fn confidence_at_critical_points() {
        assert!((chi_square_confidence(CHI_SQUARE_P05) - 0.5).abs() < f64::EPSILON);
        assert!((chi_square_confidence(CHI_SQUARE_P01) - 0.7).abs() < EPS);
        assert!((chi_square_confidence(CHI_SQUARE_P001) - 0.9).abs() < EPS);
    }

    #[test]
    fn confidence_saturates() {
        assert!(chi_square_confidence(0.0).abs() < EPS);
        assert!(chi_square_confidence(-1.0).abs() < EPS);
        assert!(chi_square_confidence(f64::NAN).abs() < EPS);
        assert!((chi_square_confidence(f64::INFINITY) - 1.0).abs() < EPS);
        let high = chi_square_confidence(100.0);
        assert!(high > 0.99 && high <= 1.0);
    }

    #[test]
    fn excess_confidence_ignores_under_representation() {
        assert!(excess_confidence(0.0, 10.0).abs() < EPS);
        assert!(excess_confidence(10.0, 10.0).abs() < EPS);
        assert!(excess_confidence(20.0, 2.0) > 0.9);
    }

    proptest! {
        #[test]
        fn prop_confidence_monotonic(a in 0.0f64..200.0, b in 0.0f64..200.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(chi_square_confidence(lo) <= chi_square_confidence(hi));
        }

        #[test]
        fn prop_confidence_in_unit_interval(x in proptest::num::f64::ANY) {
            let c = chi_square_confidence(x);
            prop_assert!((0.0..=1.0).contains(&c));
        }
    }
}
