pub mod config;
pub mod discover;
pub mod fetch;
pub mod fsutil;
pub mod mirror;
pub mod preproc;

pub use config::PipelineConfig;
pub use discover::{
    discover_subjects, DiscoveryOptions, Exclusion, SubjectDescriptor, SubjectWalker,
};
pub use fetch::{ensure_dataset, CommandFetcher, Fetcher};
pub use mirror::{save_to_layout, MirrorReport};
pub use preproc::{
    read_preproc_output, CommandPreprocessor, PreprocRequest, PreprocResult, Preprocessor,
};

use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Base of the mirrored tree; `None` means `<parent of output_dir>/.openfmri`.
    pub open_output: Option<PathBuf>,
    pub ignore_subjects: Vec<String>,
    pub restrict_subjects: Option<Vec<String>>,
    pub delete_orient: bool,
    pub dartel: bool,
    pub n_jobs: i32,
}

impl PipelineOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            data_dir: config.dataset.data_dir.clone(),
            output_dir: config.dataset.output_dir.clone(),
            open_output: config.dataset.open_output.clone(),
            ignore_subjects: config.subjects.ignore.clone(),
            restrict_subjects: config.subjects.restrict.clone(),
            delete_orient: config.preproc.delete_orient,
            dartel: config.preproc.dartel,
            n_jobs: config.preproc.n_jobs,
        }
    }

    pub fn discovery(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            ignore_subjects: self.ignore_subjects.clone(),
            restrict_subjects: self.restrict_subjects.clone(),
        }
    }
}

#[derive(Debug)]
pub struct PipelineResult {
    pub results: Vec<PreprocResult>,
    pub exclusions: Vec<Exclusion>,
    pub mirror: MirrorReport,
}

/// Preprocess a dataset laid out the OpenfMRI way and mirror the results.
///
/// A missing `data_dir` is fetched first. Subjects with missing session data
/// are skipped with a warning (see [`PipelineResult::exclusions`]).
pub fn preproc_dataset(
    options: &PipelineOptions,
    fetcher: Option<&dyn Fetcher>,
    preprocessor: &dyn Preprocessor,
) -> Result<PipelineResult> {
    ensure_dataset(&options.data_dir, fetcher)?;
    let dataset_id = mirror::study_id(&options.data_dir)?;

    let mut walker =
        SubjectWalker::new(&options.data_dir, &options.output_dir, &options.discovery())?;
    let request = PreprocRequest::new(
        &dataset_id,
        &options.output_dir,
        options.n_jobs,
        options.delete_orient,
        options.dartel,
    );
    let results = preprocessor.preprocess(&request, &mut walker)?;
    info!(
        dataset = %dataset_id,
        preprocessed = results.len(),
        excluded = walker.exclusions().len(),
        "preprocessing finished"
    );

    let mirror = save_to_layout(
        &options.data_dir,
        &options.output_dir,
        &results,
        options.open_output.as_deref(),
    )?;
    Ok(PipelineResult {
        results,
        exclusions: walker.exclusions().to_vec(),
        mirror,
    })
}
