//! Chi-square tail quantiles via the regularized incomplete gamma function.
//!
//! The quantile is searched on the survival side so that the small tail
//! probabilities used for outlier thresholds keep their precision.

use crate::error::{QcError, Result};
use statrs::function::gamma::checked_gamma_ur;

/// Survival function `P(X > x)` of the chi-square distribution.
pub fn chi2_sf(df: f64, x: f64) -> Result<f64> {
    if x <= 0.0 {
        return Ok(1.0);
    }
    checked_gamma_ur(df / 2.0, x / 2.0).map_err(|e| QcError::InvalidParameter(e.to_string()))
}

/// Inverse survival function of the chi-square distribution: the `x` with
/// `P(X > x) = p`.
pub fn chi2_isf(df: f64, p: f64) -> Result<f64> {
    if !(df > 0.0) {
        return Err(QcError::InvalidParameter(format!(
            "degrees of freedom must be positive, got {}",
            df
        )));
    }
    if !(p > 0.0 && p < 1.0) {
        return Err(QcError::InvalidParameter(format!(
            "tail probability must be in (0, 1), got {}",
            p
        )));
    }
    let mut lo = 0.0;
    let mut hi = df.max(1.0);
    while chi2_sf(df, hi)? > p {
        lo = hi;
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if chi2_sf(df, mid)? > p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-12 * hi {
            break;
        }
    }
    Ok(0.5 * (lo + hi))
}

/// Median of all values; the mean of the two middle values for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    } else {
        Some(sorted[mid])
    }
}
