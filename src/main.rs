//! tex-lane CLI
//!
//! Entry point for the `tex-lane` command-line tool.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::Ordering;

use tex_lane::config::{default_host_config_path, EffectiveConfig};
use tex_lane::logging::{self, LogFormat};
use tex_lane::outcome::{ExitCode, Outcome};
use tex_lane::pipeline::{CompileRequest, Pipeline};
use tex_lane_logscan::read_log;

/// File name of the configuration looked up next to a submission directory.
const ADJACENT_CONFIG: &str = "tex-lane.toml";

#[derive(Parser)]
#[command(name = "tex-lane")]
#[command(about = "Preflight and sandboxed compilation of TeX submissions", version)]
struct Cli {
    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Configuration file layered over the host config
    /// (default: tex-lane.toml next to the submission directory)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Maximum engine passes per entry
    #[arg(long)]
    max_passes: Option<u32>,

    /// Plans compiled concurrently
    #[arg(long)]
    jobs: Option<usize>,

    /// Resolve only against the submission tree, without the toolchain helper
    #[arg(long)]
    no_system_db: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a submission and write the outcome
    Compile {
        /// Unpacked submission directory
        dir: PathBuf,

        /// Output directory (default: <dir>.out)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,

        /// Manifest to use instead of the one at the submission root
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Name of the original archive
        #[arg(long)]
        archive_name: Option<String>,

        /// Keep working copies under <out>/.work
        #[arg(long)]
        keep_work: bool,

        /// Print the outcome record as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Classify a submission and resolve its dependencies without compiling
    Preflight {
        /// Unpacked submission directory
        dir: PathBuf,

        /// Manifest to use instead of the one at the submission root
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Classify the failure recorded in a tool log
    ClassifyLog {
        /// Log file
        file: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the effective configuration with provenance
    Config {
        /// Submission directory, for the adjacent config file
        dir: Option<PathBuf>,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() {
    let cli = Cli::parse();

    let Some(level) = logging::parse_level(&cli.log_level) else {
        eprintln!("Invalid log level: {}", cli.log_level);
        process::exit(ExitCode::Usage.as_i32());
    };
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    if let Err(e) = logging::init(level, format) {
        eprintln!("{}", e);
    }

    let code = match cli.command {
        Commands::Compile {
            dir,
            out,
            manifest,
            archive_name,
            keep_work,
            json,
            config,
        } => run_compile(&dir, out, manifest, archive_name, keep_work, json, &config),
        Commands::Preflight {
            dir,
            manifest,
            json,
            config,
        } => run_preflight(&dir, manifest, json, &config),
        Commands::ClassifyLog { file, config } => run_classify_log(&file, &config),
        Commands::Config { dir, config } => run_config(dir.as_deref(), &config),
    };
    process::exit(code.as_i32());
}

fn load_config(args: &ConfigArgs, dir: Option<&Path>) -> Result<EffectiveConfig, ExitCode> {
    let mut cli = serde_json::Map::new();
    if let Some(max_passes) = args.max_passes {
        cli.insert("max_passes".to_string(), max_passes.into());
    }
    if let Some(jobs) = args.jobs {
        cli.insert("jobs".to_string(), jobs.into());
    }
    if args.no_system_db {
        cli.insert(
            "resolver".to_string(),
            serde_json::json!({ "system_db": false }),
        );
    }
    let cli = (!cli.is_empty()).then_some(serde_json::Value::Object(cli));

    let submission_config = args.config.clone().or_else(|| dir.and_then(adjacent_config));
    let host = default_host_config_path();

    EffectiveConfig::build(host.as_deref(), submission_config.as_deref(), cli).map_err(|e| {
        eprintln!("Configuration error: {}", e);
        ExitCode::Usage
    })
}

/// `tex-lane.toml` in the directory holding the submission, if present.
fn adjacent_config(dir: &Path) -> Option<PathBuf> {
    let parent = dir.canonicalize().ok()?.parent()?.to_path_buf();
    let candidate = parent.join(ADJACENT_CONFIG);
    candidate.is_file().then_some(candidate)
}

fn default_out_dir(dir: &Path) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "submission".into());
    name.push(".out");
    dir.with_file_name(name)
}

fn run_compile(
    dir: &Path,
    out: Option<PathBuf>,
    manifest: Option<PathBuf>,
    archive_name: Option<String>,
    keep_work: bool,
    json: bool,
    args: &ConfigArgs,
) -> ExitCode {
    let effective = match load_config(args, Some(dir)) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let pipeline = Pipeline::new(effective.lane);

    let cancel = pipeline.sandbox().cancellation_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    }) {
        eprintln!("Warning: could not install signal handler: {}", e);
    }

    let request = CompileRequest {
        source: dir.to_path_buf(),
        out_dir: out.unwrap_or_else(|| default_out_dir(dir)),
        archive_name,
        manifest,
        keep_work,
    };

    match pipeline.compile(&request) {
        Ok((outcome, persisted)) => {
            if json {
                match outcome.to_json() {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("Error serializing outcome: {}", e);
                        return ExitCode::Failure;
                    }
                }
            } else {
                print_outcome(&outcome);
                println!("  Record: {}", persisted.record.display());
                if let Some(bundle) = persisted.bundle {
                    println!("  Bundle: {}", bundle.display());
                }
            }
            outcome.exit_code()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::Failure
        }
    }
}

fn print_outcome(outcome: &Outcome) {
    println!("Submission: {}", outcome.submission);
    println!("  Status: {:?}", outcome.status);
    if let Some(fatal) = &outcome.fatal {
        println!("  Fatal: {}", fatal);
    }
    for plan in &outcome.plans {
        println!(
            "  {} [{:?}] passes={} status={:?}",
            plan.entry, plan.engine, plan.passes, plan.status
        );
    }
    for output in &outcome.outputs {
        println!("  Output: {}", output);
    }
    for error in &outcome.errors {
        println!(
            "  Error (run {}): {}{}",
            error.run_seq,
            error.kind.code(),
            error
                .subject
                .as_ref()
                .map(|s| format!(" ({})", s))
                .unwrap_or_default()
        );
    }
    if !outcome.warnings.is_empty() {
        println!("  Warnings: {}", outcome.warnings.len());
    }
}

fn run_preflight(dir: &Path, manifest: Option<PathBuf>, json: bool, args: &ConfigArgs) -> ExitCode {
    let effective = match load_config(args, Some(dir)) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let pipeline = Pipeline::new(effective.lane);

    let summary = match pipeline.preflight(dir, None, manifest.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading submission: {}", e);
            return ExitCode::Failure;
        }
    };

    if json {
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                return ExitCode::Failure;
            }
        }
    } else {
        println!("Submission: {}", summary.submission);
        if let Some(plan) = &summary.plan {
            println!("  Engine: {:?}", plan.engine);
            println!("  Entries: {}", plan.entry_files().join(", "));
        }
        if let Some(tie) = &summary.tie_break {
            println!("  Tie-break: {:?} ({})", tie.rule, tie.rationale);
        }
        if let Some(fatal) = &summary.fatal {
            println!("  Fatal: {}", fatal);
        }
        if let Some(report) = &summary.dependency_report {
            println!("  Used files: {}", report.used.len());
            println!("  Unused files: {}", report.unused.len());
            for missing in &report.missing {
                println!("  Missing: {} (from {})", missing.name, missing.from);
            }
        }
        for warning in &summary.warnings {
            println!("  Warning: {:?}", warning);
        }
    }

    if summary.fatal.is_some() {
        ExitCode::Failure
    } else {
        ExitCode::Success
    }
}

fn run_classify_log(file: &Path, args: &ConfigArgs) -> ExitCode {
    let effective = match load_config(args, None) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let table = match effective.lane.signature_table() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::Usage;
        }
    };
    let log = match read_log(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error reading {}: {}", file.display(), e);
            return ExitCode::Usage;
        }
    };

    let classified = table.classify(&log);
    match serde_json::to_string_pretty(&classified) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            ExitCode::Failure
        }
    }
}

fn run_config(dir: Option<&Path>, args: &ConfigArgs) -> ExitCode {
    let effective = match load_config(args, dir) {
        Ok(c) => c,
        Err(code) => return code,
    };
    match effective.to_json() {
        Ok(text) => {
            println!("{}", text);
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("Error serializing config: {}", e);
            ExitCode::Failure
        }
    }
}
