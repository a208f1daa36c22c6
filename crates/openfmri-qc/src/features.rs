use crate::error::{QcError, Result};
use ndarray::{Array2, ArrayD, Axis};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{NiftiObject, ReaderOptions};
use std::f64::consts::LN_2;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Voxel values of one image with NaNs replaced by zero, optionally smoothed
/// with a Gaussian of `smoothing_fwhm` millimetres.
pub fn load_image(path: &Path, smoothing_fwhm: Option<f64>) -> Result<ArrayD<f64>> {
    let nifti_err = |source: nifti::NiftiError| QcError::Nifti {
        path: path.to_path_buf(),
        source,
    };
    let obj = ReaderOptions::new().read_file(path).map_err(nifti_err)?;
    let pixdim = obj.header().pixdim;
    let voxel_size = [pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64];
    let mut volume = obj.into_volume().into_ndarray::<f64>().map_err(nifti_err)?;
    volume.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
    if let Some(fwhm) = smoothing_fwhm {
        smooth_volume(&mut volume, &voxel_size, fwhm);
    }
    Ok(volume)
}

/// One row per image, one column per voxel. All images must share a shape.
pub fn load_feature_matrix(paths: &[PathBuf], smoothing_fwhm: Option<f64>) -> Result<Array2<f64>> {
    let first = paths.first().ok_or(QcError::TooFewImages { min: 1, found: 0 })?;
    let first_volume = load_image(first, smoothing_fwhm)?;
    let expected = first_volume.shape().to_vec();
    let n_features = first_volume.len();
    let mut flat = Vec::with_capacity(paths.len() * n_features);
    flat.extend(first_volume.iter().copied());
    for path in &paths[1..] {
        let volume = load_image(path, smoothing_fwhm)?;
        if volume.shape() != expected.as_slice() {
            return Err(QcError::ShapeMismatch {
                path: path.clone(),
                expected,
                found: volume.shape().to_vec(),
            });
        }
        flat.extend(volume.iter().copied());
    }
    debug!(images = paths.len(), voxels = n_features, "loaded feature matrix");
    Array2::from_shape_vec((paths.len(), n_features), flat)
        .map_err(|e| QcError::InvalidParameter(e.to_string()))
}

/// Normalised Gaussian weights, truncated at four standard deviations.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Mirror `i` back into `0..n` (`d c b a | a b c d | d c b a`).
fn reflect_index(i: isize, n: usize) -> usize {
    let n = n as isize;
    let folded = i.rem_euclid(2 * n);
    if folded >= n {
        (2 * n - 1 - folded) as usize
    } else {
        folded as usize
    }
}

/// Separable Gaussian smoothing over the three spatial axes. `voxel_size` is
/// in millimetres per axis; non-positive sizes count as 1 mm. A
/// non-positive `fwhm` leaves the volume untouched.
pub fn smooth_volume(volume: &mut ArrayD<f64>, voxel_size: &[f64], fwhm: f64) {
    if !(fwhm > 0.0) {
        return;
    }
    let sigma_mm = fwhm / (8.0 * LN_2).sqrt();
    let mut scratch = Vec::new();
    for axis in 0..volume.ndim().min(3) {
        let size = voxel_size
            .get(axis)
            .copied()
            .filter(|v| *v > 0.0)
            .unwrap_or(1.0);
        let kernel = gaussian_kernel(sigma_mm / size);
        let radius = (kernel.len() / 2) as isize;
        for mut lane in volume.lanes_mut(Axis(axis)) {
            scratch.clear();
            scratch.extend(lane.iter().copied());
            let n = scratch.len();
            for (i, out) in lane.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| w * scratch[reflect_index(i as isize + k as isize - radius, n)])
                    .sum();
            }
        }
    }
}

/// Keep the voxels whose between-image variance is at least `threshold`.
pub fn mask_low_variance(features: &Array2<f64>, threshold: f64) -> Result<Array2<f64>> {
    let variances = features.var_axis(Axis(0), 0.0);
    let keep: Vec<usize> = variances
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v >= threshold)
        .map(|(i, _)| i)
        .collect();
    if keep.is_empty() {
        return Err(QcError::EmptyMask { threshold });
    }
    debug!(
        kept = keep.len(),
        dropped = features.ncols() - keep.len(),
        "variance mask"
    );
    Ok(features.select(Axis(1), &keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, IxDyn};
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(tag: &str) -> PathBuf {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_micros();
        let root = std::env::temp_dir().join(format!(
            "openfmri_qc_{}_{}_{}",
            tag,
            std::process::id(),
            micros
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    /// Minimal single-file NIfTI-1 with float32 voxels.
    fn write_nifti(path: &Path, dims: [i16; 3], values: &[f32]) {
        let mut header = vec![0u8; 352];
        header[0..4].copy_from_slice(&348i32.to_le_bytes());
        let dim: [i16; 8] = [3, dims[0], dims[1], dims[2], 1, 1, 1, 1];
        for (i, d) in dim.iter().enumerate() {
            header[40 + 2 * i..42 + 2 * i].copy_from_slice(&d.to_le_bytes());
        }
        header[70..72].copy_from_slice(&16i16.to_le_bytes());
        header[72..74].copy_from_slice(&32i16.to_le_bytes());
        for i in 0..8 {
            header[76 + 4 * i..80 + 4 * i].copy_from_slice(&1f32.to_le_bytes());
        }
        header[108..112].copy_from_slice(&352f32.to_le_bytes());
        header[112..116].copy_from_slice(&1f32.to_le_bytes());
        header[344..348].copy_from_slice(b"n+1\0");
        for v in values {
            header.extend_from_slice(&v.to_le_bytes());
        }
        fs::write(path, header).expect("write nifti");
    }

    #[test]
    fn loads_images_and_zeroes_nans() {
        let root = temp_root("load");
        let a = root.join("a.nii");
        let b = root.join("b.nii");
        write_nifti(&a, [2, 2, 1], &[1.0, f32::NAN, 3.0, 4.0]);
        write_nifti(&b, [2, 2, 1], &[5.0, 6.0, 7.0, 8.0]);
        let matrix = load_feature_matrix(&[a, b], None).expect("load");
        assert_eq!(matrix.dim(), (2, 4));
        assert_eq!(matrix.row(0).iter().filter(|v| **v == 0.0).count(), 1);
        assert_eq!(matrix.row(1).sum(), 26.0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let root = temp_root("shape");
        let a = root.join("a.nii");
        let b = root.join("b.nii");
        write_nifti(&a, [2, 2, 1], &[1.0, 2.0, 3.0, 4.0]);
        write_nifti(&b, [4, 1, 1], &[1.0, 2.0, 3.0, 4.0]);
        match load_feature_matrix(&[a, b.clone()], None) {
            Err(QcError::ShapeMismatch { path, .. }) => assert_eq!(path, b),
            other => panic!("expected shape mismatch, got {:?}", other.map(|m| m.dim())),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_image_is_a_nifti_error() {
        let root = temp_root("missing");
        let err = load_feature_matrix(&[root.join("absent.nii")], Some(5.0)).expect_err("must fail");
        assert!(matches!(err, QcError::Nifti { .. }), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn kernel_is_normalised_and_symmetric() {
        let kernel = gaussian_kernel(2.0);
        assert_eq!(kernel.len(), 17);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(kernel[0], kernel[16]);
        assert!(kernel[8] > kernel[7]);
    }

    #[test]
    fn reflect_index_mirrors_edges() {
        let mapped: Vec<usize> = (-3..7).map(|i| reflect_index(i, 4)).collect();
        assert_eq!(mapped, vec![2, 1, 0, 0, 1, 2, 3, 3, 2, 1]);
        assert_eq!(reflect_index(5, 1), 0);
    }

    #[test]
    fn smoothing_spreads_an_impulse_and_keeps_its_mass() {
        let mut volume = ArrayD::<f64>::zeros(IxDyn(&[9, 9, 9]));
        volume[[4, 4, 4]] = 1.0;
        smooth_volume(&mut volume, &[2.0, 2.0, 2.0], 5.0);
        assert!((volume.sum() - 1.0).abs() < 1e-9);
        assert!(volume[[4, 4, 4]] < 1.0);
        assert!(volume[[3, 4, 4]] > 0.0);
        assert!((volume[[3, 4, 4]] - volume[[5, 4, 4]]).abs() < 1e-15);
        assert!((volume[[4, 3, 4]] - volume[[4, 4, 5]]).abs() < 1e-15);
    }

    #[test]
    fn smoothing_keeps_constant_volumes_and_skips_zero_fwhm() {
        let mut volume = ArrayD::<f64>::from_elem(IxDyn(&[3, 4, 5]), 7.0);
        smooth_volume(&mut volume, &[1.0, 1.0, 1.0], 5.0);
        assert!(volume.iter().all(|v| (v - 7.0).abs() < 1e-12));

        let mut impulse = ArrayD::<f64>::zeros(IxDyn(&[3, 3, 3]));
        impulse[[1, 1, 1]] = 1.0;
        let before = impulse.clone();
        smooth_volume(&mut impulse, &[1.0, 1.0, 1.0], 0.0);
        assert_eq!(impulse, before);
    }

    #[test]
    fn smoothed_load_blurs_across_voxels() {
        let root = temp_root("smooth");
        let a = root.join("a.nii");
        write_nifti(&a, [3, 1, 1], &[0.0, 9.0, 0.0]);
        let raw = load_image(&a, None).expect("raw");
        let smoothed = load_image(&a, Some(2.0)).expect("smoothed");
        assert_eq!(raw[[0, 0, 0]], 0.0);
        assert!(smoothed[[0, 0, 0]] > 0.0);
        assert!(smoothed[[1, 0, 0]] < 9.0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn mask_drops_constant_voxels() {
        let features = array![[1.0, 5.0, 0.0], [1.0, 7.0, 0.0], [1.0, 9.0, 0.0]];
        let masked = mask_low_variance(&features, 0.01).expect("mask");
        assert_eq!(masked, array![[5.0], [7.0], [9.0]]);
        assert!(matches!(
            mask_low_variance(&array![[1.0], [1.0]], 0.01),
            Err(QcError::EmptyMask { .. })
        ));
    }
}
