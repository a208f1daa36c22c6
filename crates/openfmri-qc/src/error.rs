use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QcError {
    #[error("need at least {min} images, got {found}")]
    TooFewImages { min: usize, found: usize },

    #[error("image {} has shape {found:?}, expected {expected:?}", .path.display())]
    ShapeMismatch {
        path: PathBuf,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("no voxel has between-image variance >= {threshold}")]
    EmptyMask { threshold: f64 },

    #[error("failed to read NIfTI {}: {source}", .path.display())]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, QcError>;
