//! Subject and session discovery over an OpenfMRI dataset tree.
//!
//! ```text
//! <data_dir>/sub###/BOLD/<session>/bold.nii.gz
//! <data_dir>/sub###/anatomy/highres001.nii.gz   (or highres001_brain.nii.gz)
//! ```

use crate::fsutil::{file_name_string, list_children};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SUBJECT_PATTERN: &str = "sub???";
pub const BOLD_DIR: &str = "BOLD";
pub const ANATOMY_DIR: &str = "anatomy";
pub const FUNC_FILE: &str = "bold.nii.gz";
pub const ANAT_FILE: &str = "highres001.nii.gz";
pub const ANAT_BRAIN_FILE: &str = "highres001_brain.nii.gz";

/// One subject's inputs, ready for preprocessing. `func[i]` is the image of
/// `session_ids[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDescriptor {
    pub subject_id: String,
    pub session_ids: Vec<String>,
    pub func: Vec<PathBuf>,
    pub anat: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub ignore_subjects: Vec<String>,
    /// When set, replaces the directory scan for subjects entirely.
    pub restrict_subjects: Option<Vec<String>>,
}

/// A subject dropped because `session_id` has no functional image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub subject_id: String,
    pub session_id: String,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject {} is missing data for session {}",
            self.subject_id, self.session_id
        )
    }
}

/// Lazy walk over the subjects of a dataset.
///
/// Subject ids are listed up front; sessions, functional images and anatomy
/// are only looked up when the walker is advanced.
pub struct SubjectWalker {
    data_dir: PathBuf,
    output_dir: PathBuf,
    pending: std::vec::IntoIter<String>,
    ignore: BTreeSet<String>,
    exclusions: Vec<Exclusion>,
}

impl SubjectWalker {
    pub fn new(data_dir: &Path, output_dir: &Path, options: &DiscoveryOptions) -> Result<Self> {
        let subjects: BTreeSet<String> = match &options.restrict_subjects {
            Some(restrict) => restrict.iter().cloned().collect(),
            None => list_children(data_dir, SUBJECT_PATTERN)?
                .iter()
                .map(|p| file_name_string(p))
                .collect::<Result<_>>()?,
        };
        debug!(
            data_dir = %data_dir.display(),
            subjects = subjects.len(),
            "listed subjects"
        );
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            pending: subjects.into_iter().collect::<Vec<_>>().into_iter(),
            ignore: options.ignore_subjects.iter().cloned().collect(),
            exclusions: Vec::new(),
        })
    }

    /// Subjects excluded so far for missing session data.
    pub fn exclusions(&self) -> &[Exclusion] {
        &self.exclusions
    }

    fn describe_subject(&mut self, subject_id: &str) -> Result<Option<SubjectDescriptor>> {
        let subject_dir = self.data_dir.join(subject_id);
        let session_ids = list_sessions(&subject_dir)?;

        let mut func = Vec::with_capacity(session_ids.len());
        for session_id in &session_ids {
            let candidate = subject_dir.join(BOLD_DIR).join(session_id).join(FUNC_FILE);
            if !candidate.exists() {
                let exclusion = Exclusion {
                    subject_id: subject_id.to_string(),
                    session_id: session_id.clone(),
                };
                warn!("{}", exclusion);
                warn!("excluding subject {}", subject_id);
                self.exclusions.push(exclusion);
                return Ok(None);
            }
            func.push(candidate);
        }

        Ok(Some(SubjectDescriptor {
            subject_id: subject_id.to_string(),
            session_ids,
            func,
            anat: resolve_anatomy(&subject_dir),
            output_dir: self.output_dir.join(subject_id),
        }))
    }
}

impl Iterator for SubjectWalker {
    type Item = Result<SubjectDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let subject_id = self.pending.next()?;
            if self.ignore.contains(&subject_id) {
                debug!(subject = %subject_id, "ignored");
                continue;
            }
            match self.describe_subject(&subject_id) {
                Ok(Some(subject)) => return Some(Ok(subject)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Session ids under `<subject_dir>/BOLD`, deduplicated and sorted.
pub fn list_sessions(subject_dir: &Path) -> Result<Vec<String>> {
    let sessions = list_children(&subject_dir.join(BOLD_DIR), "*")?
        .iter()
        .map(|p| file_name_string(p))
        .collect::<Result<BTreeSet<String>>>()?;
    Ok(sessions.into_iter().collect())
}

/// Full-head anatomy when present, otherwise the skull-stripped variant.
/// The fallback is not checked for existence.
pub fn resolve_anatomy(subject_dir: &Path) -> PathBuf {
    let full_head = subject_dir.join(ANATOMY_DIR).join(ANAT_FILE);
    if full_head.exists() {
        full_head
    } else {
        subject_dir.join(ANATOMY_DIR).join(ANAT_BRAIN_FILE)
    }
}

/// Drain a walker, returning the subjects kept and the exclusions raised.
pub fn discover_subjects(
    data_dir: &Path,
    output_dir: &Path,
    options: &DiscoveryOptions,
) -> Result<(Vec<SubjectDescriptor>, Vec<Exclusion>)> {
    let mut walker = SubjectWalker::new(data_dir, output_dir, options)?;
    let subjects = walker.by_ref().collect::<Result<Vec<_>>>()?;
    Ok((subjects, walker.exclusions))
}
