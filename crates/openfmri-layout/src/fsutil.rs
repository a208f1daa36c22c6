use anyhow::{anyhow, Result};
use chrono::Utc;
use glob::{MatchOptions, Pattern};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const NAME_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

pub fn ensure_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path)
        .map_err(|e| anyhow!("failed to create directory {}: {}", path.display(), e))?;
    Ok(path.to_path_buf())
}

/// Immediate children of `dir` whose file name matches `pattern`, sorted by
/// name. Leading dots must be matched literally, so `*` skips hidden entries.
/// A missing `dir` yields an empty list.
pub fn list_children(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = Pattern::new(pattern)?;
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        let matched = pattern.matches_with(&entry.file_name().to_string_lossy(), NAME_MATCH);
        if matched {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

pub fn file_name_string(path: &Path) -> Result<String> {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("path has no final component: {}", path.display()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = staging_path(path, "tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn staging_path(path: &Path, tag: &str) -> PathBuf {
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.{}.{}.{}", name, tag, pid, ts))
}

/// Removes the staged link name on drop. After a successful rename the name
/// is already gone; when source and destination were the same inode the
/// rename is a no-op and the staged name is still there.
struct StagedLink {
    path: PathBuf,
}

impl Drop for StagedLink {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Make `dest` a hard link to `src`, replacing whatever `dest` held before.
///
/// This is destructive: an existing file at `dest` is discarded even when it
/// has nothing to do with `src`. The new link is created under a staged name
/// next to `dest` and renamed over it, so `dest` never goes missing midway.
/// A missing `src` or a permission problem is returned as an error.
pub fn replace_with_hard_link(src: &Path, dest: &Path) -> Result<()> {
    let staged = StagedLink {
        path: staging_path(dest, "link"),
    };
    fs::hard_link(src, &staged.path).map_err(|e| {
        anyhow!(
            "failed to link {} -> {}: {}",
            src.display(),
            dest.display(),
            e
        )
    })?;
    fs::rename(&staged.path, dest)
        .map_err(|e| anyhow!("failed to replace {}: {}", dest.display(), e))?;
    Ok(())
}

/// Link each of `files` into `dest_dir` under its own file name.
pub fn link_files(dest_dir: &Path, files: &[PathBuf]) -> Result<usize> {
    for src in files {
        let dest = dest_dir.join(file_name_string(src)?);
        replace_with_hard_link(src, &dest)?;
    }
    Ok(files.len())
}

/// Link `src` into `dest_dir`, named `fname` or after `src` when `None`.
pub fn link_file(dest_dir: &Path, src: &Path, fname: Option<&str>) -> Result<PathBuf> {
    let fname = match fname {
        Some(name) => name.to_string(),
        None => file_name_string(src)?,
    };
    let dest = dest_dir.join(fname);
    replace_with_hard_link(src, &dest)?;
    Ok(dest)
}
