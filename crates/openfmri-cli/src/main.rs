use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use openfmri_layout::config::{CONFIG_TEMPLATE, DEFAULT_CONFIG_FILE};
use openfmri_layout::fsutil::atomic_write_json_pretty;
use openfmri_layout::preproc::PREPROC_OUTPUT_FILE;
use openfmri_layout::{
    CommandFetcher, CommandPreprocessor, Exclusion, Fetcher, MirrorReport, PipelineConfig,
    PipelineOptions, PreprocResult, SubjectDescriptor,
};
use openfmri_qc::{OutlierConfig, OutlierReport};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "openfmri",
    version,
    about = "Preprocess OpenfMRI datasets and mirror the results"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct LayoutArgs {
    /// YAML config; defaults to ./openfmri.yaml when present
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Base directory of the mirrored OpenfMRI tree
    #[arg(long)]
    open_output: Option<PathBuf>,
    #[arg(long = "ignore")]
    ignore: Vec<String>,
    #[arg(long = "restrict")]
    restrict: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch (if needed), discover, preprocess and mirror a dataset
    Preproc {
        #[command(flatten)]
        layout: LayoutArgs,
        #[arg(long)]
        delete_orient: bool,
        #[arg(long)]
        dartel: bool,
        #[arg(long, allow_hyphen_values = true)]
        n_jobs: Option<i32>,
        /// Preprocessing command, split on whitespace
        #[arg(long)]
        preproc_command: Option<String>,
        /// Dataset fetch command, split on whitespace
        #[arg(long)]
        fetch_command: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List the subjects and sessions that would be preprocessed
    Discover {
        #[command(flatten)]
        layout: LayoutArgs,
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the mirrored tree from an existing preprocessing output
    Mirror {
        #[command(flatten)]
        layout: LayoutArgs,
        /// Defaults to <output_dir>/preproc_output.json
        #[arg(long)]
        results: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Flag preprocessed images that sit far from the rest
    Outliers {
        /// Image paths or glob patterns
        #[arg(long = "images", required = true, num_args = 1..)]
        images: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = openfmri_qc::DEFAULT_VARIANCE_THRESHOLD)]
        variance_threshold: f64,
        #[arg(long, default_value_t = openfmri_qc::DEFAULT_ALPHA)]
        alpha: f64,
        /// Gaussian smoothing FWHM in millimetres; 0 disables smoothing
        #[arg(long, default_value_t = openfmri_qc::DEFAULT_SMOOTHING_FWHM)]
        fwhm: f64,
        /// Write the report as JSON to this file
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write a config template
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Preproc {
            layout,
            delete_orient,
            dartel,
            n_jobs,
            preproc_command,
            fetch_command,
            json,
        } => {
            let config = load_config(layout.config.as_deref())?;
            let mut options = resolve_options(&layout, config.as_ref())?;
            options.delete_orient |= delete_orient;
            options.dartel |= dartel;
            if let Some(n) = n_jobs {
                options.n_jobs = n;
            }

            let preproc_command = match preproc_command {
                Some(raw) => split_command(&raw),
                None => config
                    .as_ref()
                    .map(|c| c.preproc.command.clone())
                    .unwrap_or_default(),
            };
            if preproc_command.is_empty() {
                return Err(anyhow!(
                    "no preprocessing command (use --preproc-command or preproc.command)"
                ));
            }
            let fetch_command = match fetch_command {
                Some(raw) => split_command(&raw),
                None => config
                    .as_ref()
                    .map(|c| c.fetch.command.clone())
                    .unwrap_or_default(),
            };

            let preprocessor = CommandPreprocessor {
                command: preproc_command,
            };
            let fetcher = (!fetch_command.is_empty()).then(|| CommandFetcher {
                command: fetch_command,
            });
            let run = openfmri_layout::preproc_dataset(
                &options,
                fetcher.as_ref().map(|f| f as &dyn Fetcher),
                &preprocessor,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "preproc",
                    "options": options_to_json(&options),
                    "subjects": run.results.iter().map(result_to_json).collect::<Vec<_>>(),
                    "excluded": run.exclusions.iter().map(exclusion_to_json).collect::<Vec<_>>(),
                    "mirror": mirror_to_json(&run.mirror),
                })));
            }
            print_options(&options);
            for result in &run.results {
                println!(
                    "preprocessed: {} sessions={}",
                    result.subject_id,
                    result.session_ids.join(",")
                );
            }
            print_exclusions(&run.exclusions);
            print_mirror(&run.mirror);
        }
        Commands::Discover { layout, json } => {
            let config = load_config(layout.config.as_deref())?;
            let options = resolve_options(&layout, config.as_ref())?;
            let (subjects, exclusions) = openfmri_layout::discover_subjects(
                &options.data_dir,
                &options.output_dir,
                &options.discovery(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "discover",
                    "data_dir": options.data_dir.display().to_string(),
                    "subjects": subjects.iter().map(subject_to_json).collect::<Vec<_>>(),
                    "excluded": exclusions.iter().map(exclusion_to_json).collect::<Vec<_>>(),
                })));
            }
            println!("data_dir: {}", options.data_dir.display());
            println!("subjects: {}", subjects.len());
            for subject in &subjects {
                println!(
                    "subject: {} sessions={} anat={}",
                    subject.subject_id,
                    subject.session_ids.join(","),
                    subject.anat.display()
                );
            }
            print_exclusions(&exclusions);
        }
        Commands::Mirror {
            layout,
            results,
            json,
        } => {
            let config = load_config(layout.config.as_deref())?;
            let options = resolve_options(&layout, config.as_ref())?;
            let results_path =
                results.unwrap_or_else(|| options.output_dir.join(PREPROC_OUTPUT_FILE));
            let results = openfmri_layout::read_preproc_output(&results_path)?;
            let report = openfmri_layout::save_to_layout(
                &options.data_dir,
                &options.output_dir,
                &results,
                options.open_output.as_deref(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "mirror",
                    "results": results_path.display().to_string(),
                    "mirror": mirror_to_json(&report),
                })));
            }
            println!("results: {}", results_path.display());
            print_mirror(&report);
        }
        Commands::Outliers {
            images,
            limit,
            variance_threshold,
            alpha,
            fwhm,
            out,
            json,
        } => {
            let mut config = OutlierConfig::new(expand_image_patterns(&images)?);
            config.limit = limit;
            config.variance_threshold = variance_threshold;
            config.alpha = alpha;
            config.smoothing_fwhm = (fwhm != 0.0).then_some(fwhm);
            let report = openfmri_qc::run_outlier_detection(&config)?;
            let report_json = serde_json::to_value(&report)?;
            if let Some(out) = &out {
                atomic_write_json_pretty(out, &report_json)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "outliers",
                    "report": report_json,
                    "out": out.as_ref().map(|p| p.display().to_string()),
                })));
            }
            print_outlier_report(&report);
            if let Some(out) = &out {
                println!("wrote: {}", out.display());
            }
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&path, CONFIG_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: edit {} and fill in all fields marked REQUIRED", path.display());
            println!("next: openfmri discover --config {}", path.display());
        }
    }
    Ok(None)
}

fn load_config(path: Option<&Path>) -> Result<Option<PipelineConfig>> {
    match path {
        Some(p) => Ok(Some(PipelineConfig::load(p)?)),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                Ok(Some(PipelineConfig::load(default)?))
            } else {
                Ok(None)
            }
        }
    }
}

/// Config values first, command-line flags on top.
fn resolve_options(args: &LayoutArgs, config: Option<&PipelineConfig>) -> Result<PipelineOptions> {
    let base = config.map(PipelineOptions::from_config);
    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| base.as_ref().map(|b| b.data_dir.clone()))
        .ok_or_else(|| anyhow!("missing --data-dir (or dataset.data_dir in config)"))?;
    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| base.as_ref().map(|b| b.output_dir.clone()))
        .ok_or_else(|| anyhow!("missing --output-dir (or dataset.output_dir in config)"))?;
    let mut options = base.unwrap_or(PipelineOptions {
        data_dir: data_dir.clone(),
        output_dir: output_dir.clone(),
        open_output: None,
        ignore_subjects: Vec::new(),
        restrict_subjects: None,
        delete_orient: false,
        dartel: false,
        n_jobs: -1,
    });
    options.data_dir = data_dir;
    options.output_dir = output_dir;
    if args.open_output.is_some() {
        options.open_output = args.open_output.clone();
    }
    options.ignore_subjects.extend(args.ignore.iter().cloned());
    if !args.restrict.is_empty() {
        options.restrict_subjects = Some(args.restrict.clone());
    }
    Ok(options)
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

/// Expand glob patterns (plain paths pass through), sorted and deduplicated.
fn expand_image_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut out = BTreeSet::new();
    for pattern in patterns {
        let mut matched = false;
        for entry in glob::glob(pattern)? {
            out.insert(entry?);
            matched = true;
        }
        if !matched {
            return Err(anyhow!("no image matches {}", pattern));
        }
    }
    debug!(patterns = patterns.len(), images = out.len(), "expanded image patterns");
    Ok(out.into_iter().collect())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Preproc { json, .. }
        | Commands::Discover { json, .. }
        | Commands::Mirror { json, .. }
        | Commands::Outliers { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn options_to_json(options: &PipelineOptions) -> Value {
    json!({
        "data_dir": options.data_dir.display().to_string(),
        "output_dir": options.output_dir.display().to_string(),
        "open_output": options.open_output.as_ref().map(|p| p.display().to_string()),
        "ignore_subjects": options.ignore_subjects,
        "restrict_subjects": options.restrict_subjects,
        "delete_orient": options.delete_orient,
        "dartel": options.dartel,
        "n_jobs": options.n_jobs,
    })
}

fn subject_to_json(subject: &SubjectDescriptor) -> Value {
    json!({
        "subject_id": subject.subject_id,
        "session_ids": subject.session_ids,
        "func": subject.func.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        "anat": subject.anat.display().to_string(),
        "output_dir": subject.output_dir.display().to_string(),
    })
}

fn result_to_json(result: &PreprocResult) -> Value {
    json!({
        "subject_id": result.subject_id,
        "session_ids": result.session_ids,
        "anat": result.anat.display().to_string(),
        "func": result.func.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        "realignment_parameters": result
            .realignment_parameters
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
    })
}

fn exclusion_to_json(exclusion: &Exclusion) -> Value {
    json!({
        "subject_id": exclusion.subject_id,
        "missing_session": exclusion.session_id,
    })
}

fn mirror_to_json(report: &MirrorReport) -> Value {
    json!({
        "root": report.root.display().to_string(),
        "subjects": report.subjects,
        "linked": report.linked,
    })
}

fn print_options(options: &PipelineOptions) {
    println!("data_dir: {}", options.data_dir.display());
    println!("output_dir: {}", options.output_dir.display());
    if let Some(open) = &options.open_output {
        println!("open_output: {}", open.display());
    }
    if !options.ignore_subjects.is_empty() {
        println!("ignore: {}", options.ignore_subjects.join(","));
    }
    if let Some(restrict) = &options.restrict_subjects {
        println!("restrict: {}", restrict.join(","));
    }
    println!("delete_orient: {}", options.delete_orient);
    println!("dartel: {}", options.dartel);
    println!("n_jobs: {}", options.n_jobs);
}

fn print_exclusions(exclusions: &[Exclusion]) {
    for exclusion in exclusions {
        println!(
            "excluded: {} (missing session {})",
            exclusion.subject_id, exclusion.session_id
        );
    }
}

fn print_mirror(report: &MirrorReport) {
    println!("mirror_root: {}", report.root.display());
    println!("mirror_subjects: {}", report.subjects);
    println!("linked_files: {}", report.linked);
}

fn print_outlier_report(report: &OutlierReport) {
    println!("images: {}", report.n_images);
    println!("features: {}", report.n_features);
    match report.smoothing_fwhm {
        Some(fwhm) => println!("smoothing_fwhm: {}", fwhm),
        None => println!("smoothing_fwhm: none"),
    }
    println!("threshold: {:.4}", report.threshold);
    for image in &report.images {
        println!(
            "{} {:.4}{}",
            image.path.display(),
            image.score,
            if image.outlier { " OUTLIER" } else { "" }
        );
    }
    if report.outliers().next().is_none() {
        println!("no outlier found");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> LayoutArgs {
        LayoutArgs {
            data_dir: Some(PathBuf::from("/data/ds105")),
            output_dir: Some(PathBuf::from("/data/ds105_preproc")),
            ..Default::default()
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_alone_build_options() {
        let mut layout = args();
        layout.ignore = vec!["sub002".to_string()];
        let options = resolve_options(&layout, None).expect("options");
        assert_eq!(options.data_dir, PathBuf::from("/data/ds105"));
        assert_eq!(options.ignore_subjects, vec!["sub002"]);
        assert!(options.restrict_subjects.is_none());
        assert_eq!(options.n_jobs, -1);
    }

    #[test]
    fn missing_data_dir_is_reported() {
        let layout = LayoutArgs {
            output_dir: Some(PathBuf::from("/out")),
            ..Default::default()
        };
        let err = resolve_options(&layout, None).expect_err("must fail");
        assert!(err.to_string().contains("--data-dir"), "{}", err);
    }

    #[test]
    fn negative_n_jobs_parses() {
        let cli = Cli::try_parse_from([
            "openfmri",
            "preproc",
            "--data-dir",
            "/data/ds105",
            "--output-dir",
            "/out",
            "--n-jobs",
            "-1",
            "--restrict",
            "sub001",
            "--restrict",
            "sub003",
        ])
        .expect("parse");
        match cli.command {
            Commands::Preproc { n_jobs, layout, .. } => {
                assert_eq!(n_jobs, Some(-1));
                assert_eq!(layout.restrict, vec!["sub001", "sub003"]);
            }
            _ => panic!("expected preproc"),
        }
    }

    #[test]
    fn split_command_drops_extra_whitespace() {
        assert_eq!(
            split_command("  python   run_spm.py --fast "),
            vec!["python", "run_spm.py", "--fast"]
        );
    }
}
