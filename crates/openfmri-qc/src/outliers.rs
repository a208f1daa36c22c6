use crate::error::{QcError, Result};
use crate::stats::{chi2_isf, median};
use ndarray::{Array2, Axis};

#[derive(Debug, Clone)]
pub struct OutlierScores {
    /// Mean distance of each image to all images, minus the median of all
    /// pairwise distances.
    pub scores: Vec<f64>,
    pub threshold: f64,
    pub outliers: Vec<usize>,
}

/// Pairwise Euclidean distances between the rows of `features`.
pub fn euclidean_distances(features: &Array2<f64>) -> Array2<f64> {
    let n = features.nrows();
    let mut dist = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let diff = &features.row(i) - &features.row(j);
            let d = diff.dot(&diff).sqrt();
            dist[[i, j]] = d;
            dist[[j, i]] = d;
        }
    }
    dist
}

/// Flag rows whose score exceeds the chi-square (df = number of images)
/// quantile at tail probability `alpha / n`.
pub fn detect_outliers(features: &Array2<f64>, alpha: f64) -> Result<OutlierScores> {
    let n = features.nrows();
    if n < 2 {
        return Err(QcError::TooFewImages { min: 2, found: n });
    }
    let dist = euclidean_distances(features);
    let all: Vec<f64> = dist.iter().copied().collect();
    let med = median(&all).unwrap_or(0.0);
    let scores: Vec<f64> = dist
        .mean_axis(Axis(0))
        .map(|m| m.iter().map(|v| v - med).collect())
        .unwrap_or_default();
    let threshold = chi2_isf(n as f64, alpha / n as f64)?;
    let outliers = scores
        .iter()
        .enumerate()
        .filter(|&(_, &s)| s > threshold)
        .map(|(i, _)| i)
        .collect();
    Ok(OutlierScores {
        scores,
        threshold,
        outliers,
    })
}
