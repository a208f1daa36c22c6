//! Rebuilds an OpenfMRI-shaped tree from preprocessing results.
//!
//! ```text
//! <base>/<study>/*.txt
//! <base>/<study>/models/model001/*.txt
//! <base>/<study>/sub###/model/model001/anatomy/highres001.nii
//! <base>/<study>/sub###/model/model001/BOLD/<session>/{bold.nii, motion.txt}
//! <base>/<study>/sub###/model/model001/onsets/<session>/*.txt
//! ```
//!
//! Every file is a hard link placed with
//! [`replace_with_hard_link`](crate::fsutil::replace_with_hard_link), so a
//! rerun replaces what is already there.

use crate::discover::{ANATOMY_DIR, BOLD_DIR, SUBJECT_PATTERN};
use crate::fsutil::{ensure_dir, file_name_string, link_file, link_files, list_children};
use crate::preproc::PreprocResult;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MODELS_DIR: &str = "models";
pub const MODEL_DIR: &str = "model";
pub const MODEL_ID: &str = "model001";
pub const ONSETS_DIR: &str = "onsets";
pub const MIRROR_DIR: &str = ".openfmri";
pub const ANAT_NAME: &str = "highres001.nii";
pub const BOLD_NAME: &str = "bold.nii";
pub const MOTION_NAME: &str = "motion.txt";

#[derive(Debug, Clone, Serialize)]
pub struct MirrorReport {
    pub root: PathBuf,
    pub subjects: usize,
    pub linked: usize,
}

/// Study id of a dataset directory: its last path component. Paths such as
/// `.` or `ds105/sub001/..` are resolved on disk first.
pub fn study_id(data_dir: &Path) -> Result<String> {
    if data_dir.file_name().is_some() {
        return file_name_string(data_dir);
    }
    let resolved = fs::canonicalize(data_dir)
        .map_err(|e| anyhow!("failed to resolve {}: {}", data_dir.display(), e))?;
    file_name_string(&resolved)
}

/// `<base_output>/<study_id>`, or `<parent of preproc_dir>/.openfmri/<study_id>`
/// when no base is given.
pub fn mirror_root(preproc_dir: &Path, study_id: &str, base_output: Option<&Path>) -> PathBuf {
    match base_output {
        Some(base) => base.join(study_id),
        None => preproc_dir
            .parent()
            .unwrap_or(Path::new("."))
            .join(MIRROR_DIR)
            .join(study_id),
    }
}

/// Link dataset metadata and preprocessing outputs into the mirror tree.
///
/// Subjects are taken from the `sub???` directories of `preproc_dir`, and
/// each one must have an entry in `results`. Any missing source file or
/// filesystem error aborts the run; links made before the failure stay.
pub fn save_to_layout(
    data_dir: &Path,
    preproc_dir: &Path,
    results: &[PreprocResult],
    base_output: Option<&Path>,
) -> Result<MirrorReport> {
    let study = study_id(data_dir)?;
    let root = ensure_dir(&mirror_root(preproc_dir, &study, base_output))?;
    info!(study = %study, root = %root.display(), "mirroring layout");

    let by_subject: BTreeMap<&str, &PreprocResult> = results
        .iter()
        .map(|r| (r.subject_id.as_str(), r))
        .collect();

    let mut linked = 0usize;
    let models_dir = ensure_dir(&root.join(MODELS_DIR).join(MODEL_ID))?;
    let model_files = list_children(&data_dir.join(MODELS_DIR).join(MODEL_ID), "*.txt")?;
    linked += link_files(&models_dir, &model_files)?;

    let top_files = list_children(data_dir, "*.txt")?;
    linked += link_files(&root, &top_files)?;

    let subject_dirs = list_children(preproc_dir, SUBJECT_PATTERN)?;
    for subject_dir in &subject_dirs {
        let subject_id = file_name_string(subject_dir)?;
        let model_root = root.join(&subject_id).join(MODEL_DIR).join(MODEL_ID);

        let onsets_src = data_dir
            .join(&subject_id)
            .join(MODEL_DIR)
            .join(MODEL_ID)
            .join(ONSETS_DIR);
        for session_dir in list_children(&onsets_src, "*")? {
            let session_id = file_name_string(&session_dir)?;
            let onsets_dir = ensure_dir(&model_root.join(ONSETS_DIR).join(&session_id))?;
            linked += link_files(&onsets_dir, &list_children(&session_dir, "*.txt")?)?;
        }

        let result = by_subject.get(subject_id.as_str()).ok_or_else(|| {
            anyhow!(
                "no preprocessing result for subject {} found in {}",
                subject_id,
                preproc_dir.display()
            )
        })?;
        linked += link_subject_images(&model_root, result)?;
    }

    Ok(MirrorReport {
        root,
        subjects: subject_dirs.len(),
        linked,
    })
}

fn link_subject_images(model_root: &Path, result: &PreprocResult) -> Result<usize> {
    let anat_dir = ensure_dir(&model_root.join(ANATOMY_DIR))?;
    link_file(&anat_dir, &result.anat, Some(ANAT_NAME))?;
    let mut linked = 1;

    if result.session_ids.len() != result.func.len()
        || result.func.len() != result.realignment_parameters.len()
    {
        warn!(
            subject = %result.subject_id,
            sessions = result.session_ids.len(),
            func = result.func.len(),
            motion = result.realignment_parameters.len(),
            "session, func and motion lists differ in length; extra entries are skipped"
        );
    }
    for ((session_id, func), motion) in result
        .session_ids
        .iter()
        .zip(&result.func)
        .zip(&result.realignment_parameters)
    {
        let session_dir = ensure_dir(&model_root.join(BOLD_DIR).join(session_id))?;
        link_file(&session_dir, func, Some(BOLD_NAME))?;
        link_file(&session_dir, motion, Some(MOTION_NAME))?;
        linked += 2;
    }
    Ok(linked)
}
