//! Outlier detection over preprocessed brain images.
//!
//! Images are optionally smoothed and flattened into a feature matrix, voxels
//! without between-image variance are dropped, and images that sit unusually far from the rest
//! (mean Euclidean distance minus the median distance, against a
//! chi-square quantile) are flagged.

pub mod error;
pub mod features;
pub mod outliers;
pub mod stats;

pub use error::{QcError, Result};
pub use features::{load_feature_matrix, mask_low_variance, smooth_volume};
pub use outliers::{detect_outliers, euclidean_distances, OutlierScores};

use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

pub const DEFAULT_VARIANCE_THRESHOLD: f64 = 0.01;
pub const DEFAULT_ALPHA: f64 = 0.1;
pub const DEFAULT_SMOOTHING_FWHM: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct OutlierConfig {
    pub images: Vec<PathBuf>,
    /// Only the first `limit` images are used.
    pub limit: Option<usize>,
    pub variance_threshold: f64,
    pub alpha: f64,
    /// Gaussian smoothing in millimetres; `None` keeps the raw voxels.
    pub smoothing_fwhm: Option<f64>,
}

impl OutlierConfig {
    pub fn new(images: Vec<PathBuf>) -> Self {
        Self {
            images,
            limit: None,
            variance_threshold: DEFAULT_VARIANCE_THRESHOLD,
            alpha: DEFAULT_ALPHA,
            smoothing_fwhm: Some(DEFAULT_SMOOTHING_FWHM),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageScore {
    pub path: PathBuf,
    pub score: f64,
    pub outlier: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlierReport {
    pub n_images: usize,
    pub n_features: usize,
    pub alpha: f64,
    pub smoothing_fwhm: Option<f64>,
    pub threshold: f64,
    pub images: Vec<ImageScore>,
}

impl OutlierReport {
    pub fn outliers(&self) -> impl Iterator<Item = &ImageScore> {
        self.images.iter().filter(|s| s.outlier)
    }
}

pub fn run_outlier_detection(config: &OutlierConfig) -> Result<OutlierReport> {
    let mut images = config.images.clone();
    if let Some(limit) = config.limit {
        images.truncate(limit);
    }
    if images.len() < 2 {
        return Err(QcError::TooFewImages {
            min: 2,
            found: images.len(),
        });
    }
    if let Some(fwhm) = config.smoothing_fwhm {
        if !(fwhm >= 0.0) {
            return Err(QcError::InvalidParameter(format!(
                "smoothing fwhm must be non-negative, got {}",
                fwhm
            )));
        }
    }
    let features = load_feature_matrix(&images, config.smoothing_fwhm)?;
    let masked = mask_low_variance(&features, config.variance_threshold)?;
    info!(
        images = masked.nrows(),
        features = masked.ncols(),
        "computing pairwise distances"
    );
    let scores = detect_outliers(&masked, config.alpha)?;
    let mut report = build_report(images, masked.ncols(), config.alpha, scores);
    report.smoothing_fwhm = config.smoothing_fwhm;
    Ok(report)
}

fn build_report(
    images: Vec<PathBuf>,
    n_features: usize,
    alpha: f64,
    scores: OutlierScores,
) -> OutlierReport {
    let entries = images
        .into_iter()
        .zip(scores.scores)
        .enumerate()
        .map(|(i, (path, score))| ImageScore {
            path,
            score,
            outlier: scores.outliers.contains(&i),
        })
        .collect::<Vec<_>>();
    OutlierReport {
        n_images: entries.len(),
        n_features,
        alpha,
        smoothing_fwhm: None,
        threshold: scores.threshold,
        images: entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_marks_flagged_images() {
        let scores = OutlierScores {
            scores: vec![1.0, 30.0, 2.0],
            threshold: 10.0,
            outliers: vec![1],
        };
        let images = vec![
            PathBuf::from("a.nii"),
            PathBuf::from("b.nii"),
            PathBuf::from("c.nii"),
        ];
        let report = build_report(images, 42, 0.1, scores);
        assert_eq!(report.n_images, 3);
        assert_eq!(report.n_features, 42);
        let flagged: Vec<_> = report.outliers().map(|s| s.path.clone()).collect();
        assert_eq!(flagged, vec![PathBuf::from("b.nii")]);
    }

    #[test]
    fn limit_below_two_images_is_rejected() {
        let mut config = OutlierConfig::new(vec![
            PathBuf::from("a.nii"),
            PathBuf::from("b.nii"),
            PathBuf::from("c.nii"),
        ]);
        config.limit = Some(1);
        let err = run_outlier_detection(&config).expect_err("must fail");
        assert!(matches!(err, QcError::TooFewImages { min: 2, found: 1 }));
    }

    #[test]
    fn negative_fwhm_is_rejected() {
        let mut config = OutlierConfig::new(vec![PathBuf::from("a.nii"), PathBuf::from("b.nii")]);
        config.smoothing_fwhm = Some(-1.0);
        let err = run_outlier_detection(&config).expect_err("must fail");
        assert!(matches!(err, QcError::InvalidParameter(_)), "{}", err);
    }
}
