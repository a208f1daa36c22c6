use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "openfmri.yaml";

pub const CONFIG_TEMPLATE: &str = "\
version: '0.1'
dataset:
  data_dir: ''                        # REQUIRED: e.g. /data/ds105 (fetched when missing)
  output_dir: ''                      # REQUIRED: e.g. /data/ds105_preproc
  open_output: null                   # default: <parent of output_dir>/.openfmri
subjects:
  ignore: []
  restrict: null                      # list of ids to process instead of scanning sub???
preproc:
  command: []                         # REQUIRED: e.g. [python, ./run_spm_preproc.py]
  n_jobs: -1
  delete_orient: false
  dartel: false
fetch:
  command: []                         # optional: e.g. [./fetch_openfmri.sh]
";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub version: Option<String>,
    pub dataset: DatasetSection,
    #[serde(default)]
    pub subjects: SubjectsSection,
    #[serde(default)]
    pub preproc: PreprocSection,
    #[serde(default)]
    pub fetch: FetchSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSection {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub open_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubjectsSection {
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub restrict: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreprocSection {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_n_jobs")]
    pub n_jobs: i32,
    #[serde(default)]
    pub delete_orient: bool,
    #[serde(default)]
    pub dartel: bool,
}

impl Default for PreprocSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            n_jobs: default_n_jobs(),
            delete_orient: false,
            dartel: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchSection {
    #[serde(default)]
    pub command: Vec<String>,
}

fn default_n_jobs() -> i32 {
    -1
}

impl PipelineConfig {
    /// Load a config file; relative dataset paths are taken relative to the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
        let mut config: PipelineConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config {}: {}", path.display(), e))?;
        let base = path.parent().unwrap_or(Path::new("."));
        config.dataset.data_dir = resolve_relative(base, &config.dataset.data_dir);
        config.dataset.output_dir = resolve_relative(base, &config.dataset.output_dir);
        config.dataset.open_output = config
            .dataset
            .open_output
            .as_deref()
            .map(|p| resolve_relative(base, p));
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.dataset.data_dir.as_os_str().is_empty() {
            missing.push("/dataset/data_dir");
        }
        if self.dataset.output_dir.as_os_str().is_empty() {
            missing.push("/dataset/output_dir");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "config is missing required fields: {}",
                missing.join(", ")
            ))
        }
    }
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::ensure_dir;
    use chrono::Utc;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "openfmri_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    #[test]
    fn loads_config_and_resolves_relative_paths() {
        let root = temp_root("config_load");
        let path = root.join(DEFAULT_CONFIG_FILE);
        fs::write(
            &path,
            "\
dataset:
  data_dir: data/ds105
  output_dir: /abs/ds105_preproc
subjects:
  ignore: [sub002]
preproc:
  command: [python, run.py]
  dartel: true
",
        )
        .expect("write");
        let config = PipelineConfig::load(&path).expect("load");
        assert_eq!(config.dataset.data_dir, root.join("data/ds105"));
        assert_eq!(config.dataset.output_dir, PathBuf::from("/abs/ds105_preproc"));
        assert_eq!(config.subjects.ignore, vec!["sub002"]);
        assert!(config.subjects.restrict.is_none());
        assert_eq!(config.preproc.n_jobs, -1);
        assert!(config.preproc.dartel);
        assert!(!config.preproc.delete_orient);
        assert!(config.fetch.command.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn template_reports_required_fields() {
        let root = temp_root("config_template");
        let path = root.join(DEFAULT_CONFIG_FILE);
        fs::write(&path, CONFIG_TEMPLATE).expect("write");
        let err = PipelineConfig::load(&path).expect_err("template is incomplete");
        let msg = err.to_string();
        assert!(msg.contains("/dataset/data_dir"), "{}", msg);
        assert!(msg.contains("/dataset/output_dir"), "{}", msg);
        let _ = fs::remove_dir_all(root);
    }
}
