//! Outcome assembler
//!
//! Collects everything one submission produced into a single replayable
//! record: the classified file list, the dependency report, per-plan results,
//! every run in execution order, and the classified errors of failed runs.
//! The record is always produced, including when no entry point was found.

pub mod bundle;
mod status;

pub use status::{ExitCode, Status};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use tex_lane_logscan::{tail_lines, ErrorKind, SignatureTable};
use tex_lane_sandbox::{Completion, Run, RunMarker, Stage};

use crate::orchestrator::{PlanOutcome, PostProcessReport, PostProcessStep};
use crate::resolver::{DependencyReport, Resolution};
use crate::submission::{
    archive_base_name, CompilationPlan, SourceFile, Submission, SubmissionWarning, TieBreak,
};

/// Schema version for outcome.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "tex-lane/outcome@1";

/// File name of the record in the output directory and in the bundle.
pub const OUTCOME_FILE: &str = "outcome.json";

#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid bundle pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Classification of one failed run. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub run_seq: u64,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<u32>,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub excerpt: String,
}

/// Whether a run counts as failed for classification.
///
/// Auxiliary processors exit 1 on warnings, which is not a failure.
pub fn is_failed(run: &Run) -> bool {
    if run.succeeded() {
        return false;
    }
    !(run.tag.stage == Stage::Auxiliary && run.completion == Completion::Exited && run.exit_code == 1)
}

/// Classifies a failed run from its completion, marker and log text.
pub fn classify_run(run: &Run, log: Option<&str>, table: &SignatureTable, excerpt_lines: usize) -> RunError {
    let (kind, subject, excerpt) = match (run.completion, run.marker) {
        (Completion::SetupFailed, Some(RunMarker::UnknownBinaryLocation)) => (
            ErrorKind::UnknownBinaryLocation,
            run.binary.clone().or_else(|| Some(run.program.clone())),
            run.setup_error.clone().unwrap_or_default(),
        ),
        (Completion::SetupFailed, _) => (
            ErrorKind::SandboxSetupFailed,
            None,
            run.setup_error.clone().unwrap_or_default(),
        ),
        (Completion::TimedOut, _) => {
            let text = log.map(str::to_string).unwrap_or_else(|| run.combined_output());
            (
                ErrorKind::Timeout,
                None,
                tail_lines(&text, excerpt_lines).join("\n"),
            )
        }
        _ => {
            let text = log.map(str::to_string).unwrap_or_else(|| run.combined_output());
            let classified = table.classify(&text);
            (classified.kind, classified.subject, classified.excerpt)
        }
    };
    RunError {
        run_seq: run.seq,
        stage: run.tag.stage,
        entry: run.tag.entry.clone(),
        pass: run.tag.pass,
        kind,
        subject,
        excerpt,
    }
}

/// Inputs to [`Outcome::assemble`].
pub struct OutcomeParts<'a> {
    pub submission: &'a Submission,
    pub plan: Option<&'a CompilationPlan>,
    /// Reason no compilation was attempted
    pub fatal: Option<String>,
    pub resolution: Option<Resolution>,
    pub plans: Vec<PlanOutcome>,
    pub postprocess: Option<PostProcessReport>,
    pub started_at: DateTime<Utc>,
}

/// The outcome record (outcome.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub schema_version: u32,
    pub schema_id: String,
    pub outcome_id: String,

    /// Base name of the submission archive
    pub submission: String,

    pub status: Status,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,

    /// Final classification of every file
    pub tex_files: Vec<SourceFile>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tie_break: Option<TieBreak>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<CompilationPlan>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_report: Option<DependencyReport>,

    pub plans: Vec<PlanOutcome>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postprocess: Vec<PostProcessStep>,

    /// Every run, in execution order
    pub runs: Vec<Run>,

    pub errors: Vec<RunError>,

    /// Delivered files, relative to the output directory
    pub outputs: Vec<String>,

    pub warnings: Vec<SubmissionWarning>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Where a persisted outcome landed.
#[derive(Debug, Clone)]
pub struct Persisted {
    pub record: PathBuf,
    pub bundle: Option<PathBuf>,
}

impl Outcome {
    pub fn assemble(parts: OutcomeParts<'_>, table: &SignatureTable, excerpt_lines: usize) -> Self {
        let OutcomeParts {
            submission,
            plan,
            fatal,
            resolution,
            mut plans,
            postprocess,
            started_at,
        } = parts;

        let mut runs = Vec::new();
        let mut logs: BTreeMap<u64, String> = BTreeMap::new();
        let dependency_report = resolution.map(|r| {
            runs.extend(r.runs);
            r.report
        });
        for plan_outcome in &mut plans {
            runs.append(&mut plan_outcome.runs);
            logs.append(&mut plan_outcome.logs);
        }
        let (postprocess_steps, postprocess_ok, postprocess_outputs) = match postprocess {
            Some(report) => {
                let ok = report.all_succeeded();
                runs.extend(report.runs);
                (report.steps, ok, report.outputs)
            }
            None => (Vec::new(), true, Vec::new()),
        };
        runs.sort_by_key(|r| r.seq);

        let errors: Vec<RunError> = runs
            .iter()
            .filter(|r| is_failed(r))
            .map(|r| classify_run(r, logs.get(&r.seq).map(String::as_str), table, excerpt_lines))
            .collect();

        let mut status = if fatal.is_some() {
            Status::Failure
        } else {
            Status::aggregate(plans.iter().map(|p| p.status))
        };
        if !postprocess_ok {
            status = status.degrade();
        }

        let mut outputs: Vec<String> = plans.iter().filter_map(|p| p.output.clone()).collect();
        outputs.extend(postprocess_outputs);

        let outcome = Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            outcome_id: uuid::Uuid::new_v4().to_string(),
            submission: submission.archive_name.clone(),
            status,
            fatal,
            tex_files: submission.files.values().cloned().collect(),
            tie_break: plan.and_then(|p| p.tie_break.clone()),
            plan: plan.cloned(),
            dependency_report,
            plans,
            postprocess: postprocess_steps,
            runs,
            errors,
            outputs,
            warnings: submission.warnings.clone(),
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            status = ?outcome.status,
            runs = outcome.runs.len(),
            errors = outcome.errors.len(),
            "outcome assembled"
        );
        outcome
    }

    pub fn exit_code(&self) -> ExitCode {
        self.status.exit_code()
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write atomically to file (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> Result<(), OutcomeError> {
        let json = self.to_json()?;
        bundle::write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    /// Name of the bundle for this submission.
    pub fn bundle_name(&self) -> String {
        format!("{}{}", archive_base_name(&self.submission), bundle::BUNDLE_SUFFIX)
    }

    /// Writes `outcome.json` into `out_dir` and, when `include` is given,
    /// the bundle next to it.
    pub fn persist(&self, out_dir: &Path, include: Option<&[String]>) -> Result<Persisted, OutcomeError> {
        std::fs::create_dir_all(out_dir)?;
        let record = out_dir.join(OUTCOME_FILE);
        let json = self.to_json()?;
        bundle::write_atomic(&record, json.as_bytes())?;

        let bundle = match include {
            Some(patterns) => {
                let set = bundle::include_set(patterns)?;
                let files = bundle::collect(out_dir, &set)?;
                let dest = out_dir.join(self.bundle_name());
                debug!(files = files.len(), bundle = %dest.display(), "writing bundle");
                Some(bundle::write_bundle(&dest, json.as_bytes(), out_dir, &files)?)
            }
            None => None,
        };
        Ok(Persisted { record, bundle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tex_lane_sandbox::RunTag;

    fn run(seq: u64, stage: Stage, completion: Completion, exit_code: i32) -> Run {
        Run {
            seq,
            tag: RunTag::new(stage).entry("main.tex").pass(1),
            program: "pdflatex".to_string(),
            binary: Some("/tl/bin/pdflatex".to_string()),
            args: vec!["main.tex".to_string()],
            cwd: "/work".to_string(),
            profile: None,
            env_keys: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
            term_signal: None,
            completion,
            marker: None,
            setup_error: None,
            log_path: Some("main.log".to_string()),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            duration_ms: 1,
        }
    }

    fn table() -> SignatureTable {
        SignatureTable::builtin().unwrap()
    }

    #[test]
    fn test_aux_warning_exit_is_not_failure() {
        assert!(!is_failed(&run(0, Stage::Auxiliary, Completion::Exited, 1)));
        assert!(is_failed(&run(0, Stage::Auxiliary, Completion::Exited, 2)));
        assert!(is_failed(&run(0, Stage::Engine, Completion::Exited, 1)));
        assert!(!is_failed(&run(0, Stage::Engine, Completion::Exited, 0)));
    }

    #[test]
    fn test_classify_from_log() {
        let r = run(3, Stage::Engine, Completion::Exited, 1);
        let log = "(./main.tex\n! LaTeX Error: File `foo.sty' not found.\n";
        let error = classify_run(&r, Some(log), &table(), 20);
        assert_eq!(error.kind, ErrorKind::MissingPackage);
        assert_eq!(error.subject.as_deref(), Some("foo.sty"));
        assert_eq!(error.run_seq, 3);
        assert_eq!(error.pass, Some(1));
    }

    #[test]
    fn test_classify_markers() {
        let mut r = run(0, Stage::Engine, Completion::SetupFailed, 125);
        r.marker = Some(RunMarker::UnknownBinaryLocation);
        r.setup_error = Some("binary /tmp/x is not under any sandbox profile prefix".to_string());
        assert_eq!(classify_run(&r, None, &table(), 20).kind, ErrorKind::UnknownBinaryLocation);

        r.marker = Some(RunMarker::SandboxSetupFailed);
        assert_eq!(classify_run(&r, None, &table(), 20).kind, ErrorKind::SandboxSetupFailed);

        let timed_out = run(0, Stage::Engine, Completion::TimedOut, 124);
        assert_eq!(classify_run(&timed_out, Some("a\nb\n"), &table(), 1).excerpt, "b");
    }

    #[test]
    fn test_unmatched_log_is_unclassified_with_excerpt() {
        let r = run(0, Stage::Engine, Completion::Exited, 1);
        let error = classify_run(&r, Some("something odd happened\n"), &table(), 20);
        assert_eq!(error.kind, ErrorKind::Unclassified);
        assert!(error.excerpt.contains("something odd happened"));
    }
}
