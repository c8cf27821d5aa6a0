//! End-to-end processing of one submission
//!
//! scan → manifest → executable rejection → inspection → classification →
//! dependency resolution → compilation → post-processing → outcome.
//!
//! Every stage turns its failures into outcome data. The only errors
//! returned here are filesystem failures around the output directory and an
//! unusable configuration.

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use tex_lane_logscan::{SignatureTable, TexLogSignals};
use tex_lane_sandbox::Sandbox;

use crate::config::{ConfigError, LaneConfig};
use crate::manifest::{self, Directives};
use crate::orchestrator::Orchestrator;
use crate::outcome::{Outcome, OutcomeError, OutcomeParts, Persisted};
use crate::preflight::{self, PreflightError, PreflightReport};
use crate::resolver::{
    apply_report, DependencyReport, KpseToolchainDb, Resolution, Resolver, StaticToolchainDb,
    ToolchainDb,
};
use crate::submission::{CompilationPlan, SourceFile, Submission, SubmissionWarning, TieBreak};
use crate::timeout::TimeoutEnforcer;

/// Scratch directory for working copies, below the output directory.
pub const WORK_DIR: &str = ".work";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("outcome error: {0}")]
    Outcome(#[from] OutcomeError),
}

/// What to compile and where the results go.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Unpacked submission tree
    pub source: PathBuf,
    pub out_dir: PathBuf,
    /// Name of the uploaded archive; defaults to the tree's directory name
    pub archive_name: Option<String>,
    /// Manifest to use instead of the one found at the tree root
    pub manifest: Option<PathBuf>,
    /// Leave working copies in place
    pub keep_work: bool,
}

impl CompileRequest {
    pub fn new(source: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            out_dir: out_dir.into(),
            archive_name: None,
            manifest: None,
            keep_work: false,
        }
    }
}

/// Classification state of a submission before anything is compiled.
pub struct Prepared {
    pub submission: Submission,
    pub directives: Directives,
    pub report: PreflightReport,
    pub plan: Result<CompilationPlan, PreflightError>,
}

/// Printable preflight result.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightSummary {
    pub submission: String,
    pub tex_files: Vec<SourceFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<CompilationPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tie_break: Option<TieBreak>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_report: Option<DependencyReport>,
    pub warnings: Vec<SubmissionWarning>,
}

/// Runs submissions against one configuration and one sandbox.
pub struct Pipeline {
    config: LaneConfig,
    sandbox: Arc<Sandbox>,
    db: Option<Arc<dyn ToolchainDb>>,
}

impl Pipeline {
    pub fn new(config: LaneConfig) -> Self {
        let sandbox = Arc::new(Sandbox::new(config.sandbox_config()));
        Self {
            config,
            sandbox,
            db: None,
        }
    }

    /// Uses `db` instead of the configured toolchain database.
    pub fn with_toolchain_db(mut self, db: Arc<dyn ToolchainDb>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn config(&self) -> &LaneConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Scans the tree, applies the manifest and builds the compilation plan.
    pub fn prepare(
        &self,
        source: &Path,
        archive_name: Option<&str>,
        manifest_path: Option<&Path>,
    ) -> io::Result<Prepared> {
        let mut submission = Submission::scan(source, archive_name)?;
        info!(
            root = %submission.root.display(),
            files = submission.files.len(),
            "submission scanned"
        );

        let directives = manifest::read_directives(&mut submission, manifest_path);
        preflight::reject_executables(&mut submission);
        let report = preflight::inspect(&submission);
        let plan = preflight::classify(&mut submission, &directives, &report);
        match &plan {
            Ok(plan) => info!(
                engine = ?plan.engine,
                entries = ?plan.entry_files(),
                "compilation plan built"
            ),
            Err(e) => warn!(error = %e, "no compilation plan"),
        }

        Ok(Prepared {
            submission,
            directives,
            report,
            plan,
        })
    }

    /// Preflight only: classification plus dependency resolution.
    pub fn preflight(
        &self,
        source: &Path,
        archive_name: Option<&str>,
        manifest_path: Option<&Path>,
    ) -> io::Result<PreflightSummary> {
        let enforcer = TimeoutEnforcer::new(self.config.timeouts);
        let Prepared {
            mut submission,
            report,
            plan,
            ..
        } = self.prepare(source, archive_name, manifest_path)?;

        let (plan, fatal, dependency_report) = match plan {
            Ok(plan) => {
                let resolution = self.resolve(&submission, &report, &plan, &enforcer);
                apply_report(&mut submission, &resolution.report);
                (Some(plan), None, Some(resolution.report))
            }
            Err(e) => (None, Some(e.to_string()), None),
        };

        Ok(PreflightSummary {
            submission: submission.archive_name.clone(),
            tex_files: submission.files.values().cloned().collect(),
            tie_break: plan.as_ref().and_then(|p| p.tie_break.clone()),
            plan,
            fatal,
            dependency_report,
            warnings: submission.warnings,
        })
    }

    /// Compiles a submission and persists its outcome into `request.out_dir`.
    ///
    /// Once the output directory exists an outcome is always written; later
    /// filesystem failures end up in its `fatal` field.
    pub fn compile(&self, request: &CompileRequest) -> Result<(Outcome, Persisted), PipelineError> {
        let started_at = Utc::now();
        let enforcer = TimeoutEnforcer::new(self.config.timeouts);
        let table = self.config.signature_table()?;

        fs::create_dir_all(&request.out_dir)?;
        let out_dir = request.out_dir.canonicalize()?;
        let archive_name = request.archive_name.as_deref();

        let prepared = match self.prepare(&request.source, archive_name, request.manifest.as_deref()) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, source = %request.source.display(), "submission could not be read");
                let submission = Submission::empty(&request.source, archive_name);
                let parts = OutcomeParts {
                    submission: &submission,
                    plan: None,
                    fatal: Some(format!("submission could not be read: {}", e)),
                    resolution: None,
                    plans: Vec::new(),
                    postprocess: None,
                    started_at,
                };
                return self.finish(parts, &table, &out_dir);
            }
        };
        let Prepared {
            mut submission,
            report,
            plan,
            ..
        } = prepared;

        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                let parts = OutcomeParts {
                    submission: &submission,
                    plan: None,
                    fatal: Some(e.to_string()),
                    resolution: None,
                    plans: Vec::new(),
                    postprocess: None,
                    started_at,
                };
                return self.finish(parts, &table, &out_dir);
            }
        };

        let resolution = self.resolve(&submission, &report, &plan, &enforcer);
        apply_report(&mut submission, &resolution.report);

        let work_root = out_dir.join(WORK_DIR);
        if let Err(e) = fs::create_dir_all(&work_root) {
            warn!(error = %e, dir = %work_root.display(), "could not create working directory");
            let parts = OutcomeParts {
                submission: &submission,
                plan: Some(&plan),
                fatal: Some(format!("could not create working directory: {}", e)),
                resolution: Some(resolution),
                plans: Vec::new(),
                postprocess: None,
                started_at,
            };
            return self.finish(parts, &table, &out_dir);
        }
        let settings = self.config.orchestrator_settings();
        let signals = TexLogSignals::new();
        let orchestrator = Orchestrator::new(&self.sandbox, &signals, &enforcer, &settings);

        let plans = orchestrator.compile(&submission, &plan, &work_root, &out_dir);
        let postprocess = orchestrator.postprocess(&mut submission, &plan, &plans, &out_dir);

        if !request.keep_work {
            if let Err(e) = fs::remove_dir_all(&work_root) {
                warn!(error = %e, dir = %work_root.display(), "could not remove working copies");
            }
        }

        let parts = OutcomeParts {
            submission: &submission,
            plan: Some(&plan),
            fatal: None,
            resolution: Some(resolution),
            plans,
            postprocess: Some(postprocess),
            started_at,
        };
        self.finish(parts, &table, &out_dir)
    }

    fn finish(
        &self,
        parts: OutcomeParts<'_>,
        table: &SignatureTable,
        out_dir: &Path,
    ) -> Result<(Outcome, Persisted), PipelineError> {
        let outcome = Outcome::assemble(parts, table, self.config.outcome.excerpt_lines);
        let persisted = self.persist(&outcome, out_dir)?;
        Ok((outcome, persisted))
    }

    fn resolve(
        &self,
        submission: &Submission,
        report: &PreflightReport,
        plan: &CompilationPlan,
        enforcer: &TimeoutEnforcer,
    ) -> Resolution {
        let options = self.config.resolver_options();
        if let Some(db) = &self.db {
            return Resolver::new(db.as_ref(), options).resolve(submission, report, plan);
        }
        match self.config.resolver.helper.split_first() {
            Some((program, args)) if self.config.resolver.system_db => {
                let db = KpseToolchainDb::new(Arc::clone(&self.sandbox), program.clone(), args.to_vec())
                    .with_timeout(enforcer.invocation_budget());
                Resolver::new(&db, options).resolve(submission, report, plan)
            }
            _ => {
                let db = StaticToolchainDb::new();
                Resolver::new(&db, options).resolve(submission, report, plan)
            }
        }
    }

    fn persist(&self, outcome: &Outcome, out_dir: &Path) -> Result<Persisted, PipelineError> {
        let include = self
            .config
            .outcome
            .bundle
            .then_some(self.config.outcome.bundle_include.as_slice());
        let persisted = outcome.persist(out_dir, include)?;
        info!(
            status = ?outcome.status,
            record = %persisted.record.display(),
            "outcome persisted"
        );
        Ok(persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationMode;
    use crate::outcome::Status;
    use tempfile::TempDir;

    fn offline_config() -> LaneConfig {
        let mut config = LaneConfig::default();
        config.sandbox.isolation = IsolationMode::None;
        config.resolver.system_db = false;
        config
    }

    #[test]
    fn test_prepare_builds_plan() {
        let src = TempDir::new().unwrap();
        fs::write(
            src.path().join("main.tex"),
            "\\documentclass{article}\n\\begin{document}\nHi\n\\end{document}\n",
        )
        .unwrap();

        let pipeline = Pipeline::new(offline_config());
        let prepared = pipeline.prepare(src.path(), Some("paper.tar.gz"), None).unwrap();
        let plan = prepared.plan.unwrap();
        assert_eq!(plan.entry_files(), vec!["main.tex"]);
        assert_eq!(prepared.submission.archive_name, "paper");
    }

    #[test]
    fn test_no_entry_point_is_a_failed_outcome() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(src.path().join("notes.txt"), "nothing to compile").unwrap();

        let pipeline = Pipeline::new(offline_config());
        let request = CompileRequest::new(src.path(), out.path());
        let (outcome, persisted) = pipeline.compile(&request).unwrap();

        assert_eq!(outcome.status, Status::Failure);
        assert!(outcome.fatal.as_deref().unwrap_or("").contains("no entry point"));
        assert!(outcome.runs.is_empty());
        assert!(persisted.record.is_file());
        assert!(persisted.bundle.map(|b| b.is_file()).unwrap_or(false));
    }

    #[test]
    fn test_unreadable_source_still_writes_outcome() {
        let out = TempDir::new().unwrap();
        let missing = out.path().join("no-such-tree");

        let pipeline = Pipeline::new(offline_config());
        let mut request = CompileRequest::new(&missing, out.path().join("result"));
        request.archive_name = Some("paper.zip".to_string());
        let (outcome, persisted) = pipeline.compile(&request).unwrap();

        assert_eq!(outcome.status, Status::Failure);
        assert_eq!(outcome.submission, "paper");
        assert!(outcome
            .fatal
            .as_deref()
            .unwrap_or("")
            .starts_with("submission could not be read"));
        assert!(persisted.record.is_file());
    }

    #[test]
    fn test_preflight_summary_without_system_db() {
        let src = TempDir::new().unwrap();
        fs::write(
            src.path().join("main.tex"),
            "\\documentclass{article}\n\\begin{document}\n\\input{intro}\n\\end{document}\n",
        )
        .unwrap();
        fs::write(src.path().join("intro.tex"), "Intro.\n").unwrap();

        let pipeline = Pipeline::new(offline_config());
        let summary = pipeline.preflight(src.path(), None, None).unwrap();
        assert!(summary.fatal.is_none());
        let report = summary.dependency_report.unwrap();
        assert!(report.used.contains("intro.tex"));
    }
}
