use crate::discover::SubjectDescriptor;
use crate::fsutil::{atomic_write_bytes, ensure_dir};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::info;

pub const DATASET_DESCRIPTION: &str = "\
<p><a href=\"https://openfmri.org/data-sets\">openfmri.org datasets</a>.</p>
";

pub const PREPROC_INPUT_FILE: &str = "preproc_input.json";
pub const PREPROC_OUTPUT_FILE: &str = "preproc_output.json";

/// Per-subject outputs of preprocessing. `session_ids`, `func` and
/// `realignment_parameters` are aligned by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocResult {
    pub subject_id: String,
    pub session_ids: Vec<String>,
    pub anat: PathBuf,
    pub func: Vec<PathBuf>,
    pub realignment_parameters: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreprocRequest {
    pub dataset_id: String,
    pub output_dir: PathBuf,
    pub n_jobs: i32,
    pub delete_orient: bool,
    pub dartel: bool,
    pub coreg_anat_to_func: bool,
    pub dataset_description: String,
}

impl PreprocRequest {
    /// Anatomy-to-functional coregistration is always on; the remaining
    /// flags are passed through as given.
    pub fn new(
        dataset_id: &str,
        output_dir: &Path,
        n_jobs: i32,
        delete_orient: bool,
        dartel: bool,
    ) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            output_dir: output_dir.to_path_buf(),
            n_jobs,
            delete_orient,
            dartel,
            coreg_anat_to_func: true,
            dataset_description: DATASET_DESCRIPTION.to_string(),
        }
    }
}

pub trait Preprocessor {
    fn preprocess(
        &self,
        request: &PreprocRequest,
        subjects: &mut dyn Iterator<Item = Result<SubjectDescriptor>>,
    ) -> Result<Vec<PreprocResult>>;
}

#[derive(Debug, Deserialize)]
struct PreprocOutput {
    schema_version: String,
    subjects: Vec<PreprocResult>,
}

/// Hands subjects to an external preprocessing command.
///
/// The command receives `preproc_input.json` on stdin and via
/// `OPENFMRI_PREPROC_INPUT`, and is expected to write `preproc_output.json`
/// at `OPENFMRI_PREPROC_OUTPUT`. When it does not, the last non-empty stdout
/// line is taken as the output document if it parses as JSON.
#[derive(Debug, Clone)]
pub struct CommandPreprocessor {
    pub command: Vec<String>,
}

impl Preprocessor for CommandPreprocessor {
    fn preprocess(
        &self,
        request: &PreprocRequest,
        subjects: &mut dyn Iterator<Item = Result<SubjectDescriptor>>,
    ) -> Result<Vec<PreprocResult>> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("preprocessing command is empty"))?;
        let subjects = subjects.collect::<Result<Vec<_>>>()?;
        ensure_dir(&request.output_dir)?;

        let input_path = request.output_dir.join(PREPROC_INPUT_FILE);
        let output_path = request.output_dir.join(PREPROC_OUTPUT_FILE);
        let input = build_preproc_input(request, &subjects);
        let input_bytes = serde_json::to_vec_pretty(&input)?;
        atomic_write_bytes(&input_path, &input_bytes)?;
        if output_path.exists() {
            fs::remove_file(&output_path)?;
        }

        info!(
            dataset = %request.dataset_id,
            subjects = subjects.len(),
            n_jobs = request.n_jobs,
            "starting preprocessing"
        );
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(&request.output_dir);
        cmd.env("OPENFMRI_PREPROC_INPUT", &input_path);
        cmd.env("OPENFMRI_PREPROC_OUTPUT", &output_path);
        cmd.env("OPENFMRI_N_JOBS", request.n_jobs.to_string());
        run_process_with_io(cmd, &input_bytes, &output_path)?;
        read_preproc_output(&output_path)
    }
}

fn build_preproc_input(request: &PreprocRequest, subjects: &[SubjectDescriptor]) -> Value {
    json!({
        "schema_version": "preproc_input_v1",
        "created_at": Utc::now().to_rfc3339(),
        "request": request,
        "subjects": subjects,
    })
}

fn run_process_with_io(mut cmd: Command, input_bytes: &[u8], output_path: &Path) -> Result<()> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("failed to start preprocessing command: {}", e))?;
    // stdin is fed from its own thread while stdout is drained; a command
    // that ignores stdin and fills the stdout pipe must not block us.
    let feeder = child.stdin.take().map(|mut stdin| {
        let bytes = input_bytes.to_vec();
        thread::spawn(move || {
            // The command may not read stdin at all.
            let _ = stdin.write_all(&bytes);
        })
    });
    let output = child.wait_with_output()?;
    if let Some(handle) = feeder {
        let _ = handle.join();
    }
    if !output.status.success() {
        return Err(anyhow!("preprocessing command failed: {}", output.status));
    }

    if !output_path.exists() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let last_line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|s| s.trim().to_string());
        match last_line {
            Some(line) if serde_json::from_str::<Value>(&line).is_ok() => {
                atomic_write_bytes(output_path, line.as_bytes())?;
            }
            _ => {
                return Err(anyhow!(
                    "preprocessing command exited without writing {}",
                    output_path.display()
                ))
            }
        }
    }
    Ok(())
}

pub fn read_preproc_output(path: &Path) -> Result<Vec<PreprocResult>> {
    let bytes = fs::read(path)
        .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    let output: PreprocOutput = serde_json::from_slice(&bytes)
        .map_err(|e| anyhow!("invalid preprocessing output {}: {}", path.display(), e))?;
    if output.schema_version != "preproc_output_v1" {
        return Err(anyhow!(
            "unsupported preprocessing output schema_version: {}",
            output.schema_version
        ));
    }
    Ok(output.subjects)
}
