use crate::fsutil::{ensure_dir, file_name_string};
use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Command;
use tracing::info;

/// Downloads a dataset by id into a destination directory.
pub trait Fetcher {
    fn fetch(&self, dataset_id: &str, dest_dir: &Path) -> Result<()>;
}

/// Runs an external command to download a dataset. The dataset id and the
/// destination are passed as `OPENFMRI_DATASET_ID` and `OPENFMRI_FETCH_DIR`.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    pub command: Vec<String>,
}

impl Fetcher for CommandFetcher {
    fn fetch(&self, dataset_id: &str, dest_dir: &Path) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("fetch command is empty"))?;
        ensure_dir(dest_dir)?;
        let status = Command::new(program)
            .args(args)
            .current_dir(dest_dir)
            .env("OPENFMRI_DATASET_ID", dataset_id)
            .env("OPENFMRI_FETCH_DIR", dest_dir)
            .status()
            .map_err(|e| anyhow!("failed to start fetch command {}: {}", program, e))?;
        if !status.success() {
            return Err(anyhow!(
                "fetch of dataset {} failed: {}",
                dataset_id,
                status
            ));
        }
        Ok(())
    }
}

/// Fetch `data_dir` when it is not on disk yet. The last path component is
/// the dataset id and its parent the download destination. Fetch errors are
/// returned as they come; there is no retry.
pub fn ensure_dataset(data_dir: &Path, fetcher: Option<&dyn Fetcher>) -> Result<()> {
    if data_dir.exists() {
        return Ok(());
    }
    let dataset_id = file_name_string(data_dir)?;
    let parent = data_dir.parent().unwrap_or(Path::new("."));
    let fetcher = fetcher.ok_or_else(|| {
        anyhow!(
            "dataset directory not found and no fetcher configured: {}",
            data_dir.display()
        )
    })?;
    info!(dataset = %dataset_id, dest = %parent.display(), "fetching dataset");
    fetcher.fetch(&dataset_id, parent)?;
    if !data_dir.exists() {
        return Err(anyhow!(
            "fetch of dataset {} finished but {} does not exist",
            dataset_id,
            data_dir.display()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::fs;
    use std::path::PathBuf;

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

    #[derive(Default)]
    struct RecordingFetcher {
        calls: RefCell<Vec<(String, PathBuf)>>,
        create: bool,
        fail: bool,
    }

    impl Fetcher for RecordingFetcher {
        fn fetch(&self, dataset_id: &str, dest_dir: &Path) -> Result<()> {
            self.calls
                .borrow_mut()
                .push((dataset_id.to_string(), dest_dir.to_path_buf()));
            if self.fail {
                return Err(anyhow!("network unreachable"));
            }
            if self.create {
                ensure_dir(&dest_dir.join(dataset_id))?;
            }
            Ok(())
        }
    }

    #[test]
    fn existing_dataset_is_not_fetched() {
        let root = temp_root("fetch_existing");
        let fetcher = RecordingFetcher::default();
        ensure_dataset(&root, Some(&fetcher)).expect("no-op");
        assert!(fetcher.calls.borrow().is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_dataset_is_fetched_into_parent() {
        let root = temp_root("fetch_missing");
        let fetcher = RecordingFetcher {
            create: true,
            ..Default::default()
        };
        ensure_dataset(&root.join("ds105"), Some(&fetcher)).expect("fetch");
        assert_eq!(
            fetcher.calls.borrow().as_slice(),
            &[("ds105".to_string(), root.clone())]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fetch_failure_propagates() {
        let root = temp_root("fetch_fail");
        let fetcher = RecordingFetcher {
            fail: true,
            ..Default::default()
        };
        let err = ensure_dataset(&root.join("ds105"), Some(&fetcher)).expect_err("must fail");
        assert!(err.to_string().contains("network unreachable"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_dataset_without_fetcher_is_an_error() {
        let root = temp_root("fetch_none");
        let err = ensure_dataset(&root.join("ds105"), None).expect_err("must fail");
        assert!(err.to_string().contains("no fetcher"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn command_fetcher_exposes_dataset_id() {
        let root = temp_root("fetch_command");
        let fetcher = CommandFetcher {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "mkdir -p \"$OPENFMRI_FETCH_DIR/$OPENFMRI_DATASET_ID\"".to_string(),
            ],
        };
        ensure_dataset(&root.join("ds017"), Some(&fetcher)).expect("fetch");
        assert!(root.join("ds017").is_dir());

        let failing = CommandFetcher {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
        };
        let err = ensure_dataset(&root.join("ds018"), Some(&failing)).expect_err("must fail");
        assert!(err.to_string().contains("ds018"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
