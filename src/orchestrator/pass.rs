//! Pass loop for one plan entry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use tex_lane_logscan::{read_log, AuxKind};
use tex_lane_sandbox::{Completion, Invocation, Run, RunTag, Stage, ENGINE_ENV};

use super::state::{AbortReason, PassMachine, PassState, TerminalState};
use super::workspace;
use super::{Orchestrator, PlanOutcome};
use crate::outcome::Status;
use crate::submission::{CompilationPlan, Engine, PlanEntry, Submission};

/// Aux processors exit 1 for warnings; only higher codes are failures.
const AUX_WARNING_EXIT: i32 = 1;

/// Mutable state of one entry's compilation.
pub(crate) struct EntryDriver<'o, 'a> {
    orch: &'o Orchestrator<'a>,
    plan: &'o CompilationPlan,
    entry: &'o PlanEntry,
    workspace: PathBuf,
    cwd: PathBuf,
    machine: PassMachine,
    runs: Vec<Run>,
    logs: BTreeMap<u64, String>,
    aux_runs: Vec<AuxKind>,
    notes: Vec<String>,
}

impl<'o, 'a> EntryDriver<'o, 'a> {
    pub(crate) fn new(
        orch: &'o Orchestrator<'a>,
        plan: &'o CompilationPlan,
        entry: &'o PlanEntry,
        workspace: PathBuf,
    ) -> Self {
        let cwd = match entry.dir() {
            "" => workspace.clone(),
            dir => workspace.join(dir),
        };
        Self {
            orch,
            plan,
            entry,
            workspace,
            cwd,
            machine: PassMachine::new(orch.settings.max_passes),
            runs: Vec::new(),
            logs: BTreeMap::new(),
            aux_runs: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Prepares the working copy, runs the passes and collects output.
    pub(crate) fn run(mut self, submission: &Submission, out_dir: &Path) -> PlanOutcome {
        if let Err(e) = self.prepare(submission) {
            warn!(entry = %self.entry.file, error = %e, "workspace setup failed");
            self.notes.push(format!("workspace setup failed: {}", e));
            self.abort(AbortReason::ToolHardFailure);
            return self.finish(out_dir);
        }

        self.passes();

        if self.entry.engine.produces_dvi()
            && self.machine.state().abort_reason() != Some(AbortReason::Cancelled)
            && self.job_file("dvi").is_file()
        {
            self.convert();
        }
        self.finish(out_dir)
    }

    fn prepare(&mut self, submission: &Submission) -> std::io::Result<()> {
        workspace::prepare(submission, &self.workspace)?;
        if self.orch.settings.fixups {
            for path in workspace::apply_fixups(submission, &self.workspace)? {
                debug!(entry = %self.entry.file, file = %path, "fixup applied");
                self.notes.push(format!("fixup applied to {}", path));
            }
        }
        Ok(())
    }

    fn passes(&mut self) {
        let mut previous_digest: Option<String> = None;
        let mut last_aux: Option<AuxKind> = None;

        loop {
            if self.orch.sandbox.is_cancelled() {
                self.abort(AbortReason::Cancelled);
                return;
            }
            let n = match self.machine.next_pass() {
                Ok(PassState::Pass { n }) => n,
                Ok(state) => {
                    info!(entry = %self.entry.file, ?state, "pass budget exhausted");
                    return;
                }
                Err(e) => {
                    warn!(entry = %self.entry.file, error = %e, "pass machine rejected transition");
                    return;
                }
            };

            let run = self.engine_pass(n);
            let log = self.log_for(&run, "log");
            let succeeded = run.succeeded();
            let completion = run.completion;
            self.logs.insert(run.seq, log.clone());
            self.runs.push(run);

            if completion != Completion::Exited {
                let reason = self.interruption(completion);
                self.abort(reason);
                return;
            }

            let aux = self.aux_request(&log);
            let logged_rerun = self.orch.signals.signals_rerun(&log);
            if !succeeded {
                // A non-zero exit is recoverable only with output and a signal to go on
                if (aux.is_none() && !logged_rerun) || !self.has_output() {
                    self.abort(AbortReason::ToolHardFailure);
                    return;
                }
                debug!(
                    entry = %self.entry.file,
                    pass = n,
                    "non-zero exit with a rerun signal, continuing"
                );
            }

            let digest = workspace::aux_digest(&self.cwd, self.entry.job_name());

            if let Some(kind) = aux {
                if last_aux == Some(kind) {
                    info!(
                        entry = %self.entry.file,
                        aux = kind.processor(),
                        "auxiliary step requested twice in a row"
                    );
                    self.abort(AbortReason::AuxNotConverging);
                    return;
                }
                if !self.machine.has_budget() {
                    if let Err(e) = self.machine.next_pass() {
                        warn!(
                            entry = %self.entry.file,
                            error = %e,
                            "pass machine rejected transition"
                        );
                    }
                    return;
                }
                if let Err(reason) = self.aux_pass(kind, n) {
                    self.abort(reason);
                    return;
                }
                last_aux = Some(kind);
                previous_digest = digest;
                continue;
            }
            last_aux = None;

            let digest_changed = previous_digest.is_some() && previous_digest != digest;
            previous_digest = digest;
            if logged_rerun || digest_changed {
                debug!(
                    entry = %self.entry.file,
                    pass = n,
                    logged_rerun,
                    digest_changed,
                    "rerun needed"
                );
                continue;
            }

            if let Err(e) = self.machine.converge() {
                warn!(entry = %self.entry.file, error = %e, "pass machine rejected transition");
            }
            info!(entry = %self.entry.file, passes = n, "converged");
            return;
        }
    }

    /// The aux step the log asks for, after dropping requests that cannot run.
    fn aux_request(&self, log: &str) -> Option<AuxKind> {
        let kind = self.orch.signals.requests_aux_pass(log)?;
        if kind.is_bibliography() && self.entry.prebuilt_bbl {
            debug!(
                entry = %self.entry.file,
                "bibliography step skipped, .bbl shipped with sources"
            );
            return None;
        }
        if !self.job_file(kind.input_extension()).is_file() {
            debug!(
                entry = %self.entry.file,
                aux = kind.processor(),
                "auxiliary input missing, step skipped"
            );
            return None;
        }
        Some(kind)
    }

    fn engine_pass(&mut self, n: u32) -> Run {
        let engine = self.entry.engine;
        let program = self.orch.settings.tools.engine(engine).to_string();
        let mut args = vec!["-interaction=batchmode".to_string(), "-recorder".to_string()];
        if engine.is_latex() {
            args.push("-file-line-error".to_string());
        }
        if engine == Engine::PdfLatex && !self.entry.pdfoutput_declared {
            args.push("-output-format=pdf".to_string());
        }
        args.push(file_name(&self.entry.file).to_string());

        let tag = RunTag::new(Stage::Engine).entry(&self.entry.file).pass(n);
        let mut invocation = self
            .invocation(tag, program)
            .args(args)
            .log_path(format!("{}.log", self.entry.job_name()));
        for (key, value) in ENGINE_ENV {
            invocation = invocation.env(*key, *value);
        }
        let run = self.orch.sandbox.run(&invocation);
        info!(
            entry = %self.entry.file,
            pass = n,
            engine = %engine,
            exit_code = run.exit_code,
            "engine pass finished"
        );
        run
    }

    fn aux_pass(&mut self, kind: AuxKind, n: u32) -> Result<(), AbortReason> {
        let job = self.entry.job_name().to_string();
        let target = match kind {
            AuxKind::Makeindex => format!("{}.idx", job),
            AuxKind::Bibtex | AuxKind::Biber => job.clone(),
        };
        let log_ext = match kind {
            AuxKind::Makeindex => "ilg",
            AuxKind::Bibtex | AuxKind::Biber => "blg",
        };
        let program = self.orch.settings.tools.aux(kind).to_string();
        let tag = RunTag::new(Stage::Auxiliary).entry(&self.entry.file).pass(n);
        let invocation = self
            .invocation(tag, program)
            .args([target])
            .log_path(format!("{}.{}", job, log_ext));
        let run = self.orch.sandbox.run(&invocation);
        info!(
            entry = %self.entry.file,
            aux = kind.processor(),
            exit_code = run.exit_code,
            "auxiliary step finished"
        );

        let log = self.log_for(&run, log_ext);
        let completion = run.completion;
        let exit_code = run.exit_code;
        self.logs.insert(run.seq, log);
        self.runs.push(run);
        self.aux_runs.push(kind);

        match completion {
            Completion::Exited if exit_code <= AUX_WARNING_EXIT => Ok(()),
            Completion::Exited => Err(AbortReason::ToolHardFailure),
            other => Err(self.interruption(other)),
        }
    }

    /// Abort reason for a run that did not exit on its own. A run cut short
    /// by the spent submission budget counts as cancelled.
    fn interruption(&self, completion: Completion) -> AbortReason {
        let budget_spent =
            completion == Completion::TimedOut && self.orch.enforcer.check().is_timeout();
        if completion == Completion::Cancelled || budget_spent {
            AbortReason::Cancelled
        } else {
            AbortReason::ToolHardFailure
        }
    }

    /// DVI → PostScript → PDF.
    fn convert(&mut self) {
        let job = self.entry.job_name().to_string();
        let mut run = self.dvips(&job, true);
        if !run.succeeded() && run.completion == Completion::Exited {
            debug!(entry = %self.entry.file, "dvips failed with hyperdvi, retrying without -z");
            self.runs.push(run);
            run = self.dvips(&job, false);
        }
        let ok = run.succeeded();
        self.runs.push(run);
        if !ok {
            self.notes.push("dvips failed".to_string());
            return;
        }

        let tools = &self.orch.settings.tools;
        let tag = RunTag::new(Stage::Convert).entry(&self.entry.file);
        let invocation = self
            .invocation(tag, tools.ps2pdf.clone())
            .args([format!("{}.ps", job), format!("{}.pdf", job)]);
        let run = self.orch.sandbox.run(&invocation);
        if !run.succeeded() {
            self.notes.push("ps2pdf failed".to_string());
        }
        self.runs.push(run);
    }

    fn dvips(&self, job: &str, hyper: bool) -> Run {
        let attributes = &self.entry.attributes;
        let mut args = vec!["-R2".to_string()];
        if attributes.landscape {
            args.extend(["-t".to_string(), "landscape".to_string()]);
        }
        if !attributes.keep_comments {
            args.push("-K".to_string());
        }
        for map in self.plan.font_maps.iter().chain(&attributes.font_maps) {
            args.push("-u".to_string());
            args.push(if map.starts_with('+') { map.clone() } else { format!("+{}", map) });
        }
        if hyper {
            args.push("-z".to_string());
        }
        args.extend(["-o".to_string(), format!("{}.ps", job), format!("{}.dvi", job)]);

        let tag = RunTag::new(Stage::Convert).entry(&self.entry.file);
        let program = self.orch.settings.tools.dvips.clone();
        self.orch.sandbox.run(&self.invocation(tag, program).args(args))
    }

    fn invocation(&self, tag: RunTag, program: String) -> Invocation {
        let mut invocation = Invocation::new(tag, program, &self.cwd)
            .timeout(self.orch.enforcer.invocation_budget());
        invocation.allow_write = vec![self.workspace.clone()];
        for path in &self.orch.settings.extra_read_only {
            invocation = invocation.allow_read(path.clone());
        }
        invocation
    }

    /// The tool log if it was written, otherwise the captured output.
    fn log_for(&self, run: &Run, ext: &str) -> String {
        let path = self.job_file(ext);
        match read_log(&path) {
            Ok(text) if run.completion != Completion::SetupFailed => text,
            _ => run.combined_output(),
        }
    }

    /// Whether the engine has left a PDF or DVI behind.
    fn has_output(&self) -> bool {
        self.job_file("pdf").is_file() || self.job_file("dvi").is_file()
    }

    fn job_file(&self, ext: &str) -> PathBuf {
        self.cwd.join(format!("{}.{}", self.entry.job_name(), ext))
    }

    fn abort(&mut self, reason: AbortReason) {
        if let Err(e) = self.machine.abort(reason) {
            warn!(entry = %self.entry.file, error = %e, "pass machine rejected transition");
        }
    }

    /// Copies output and log to `out_dir` and computes the plan status.
    fn finish(mut self, out_dir: &Path) -> PlanOutcome {
        let state = self.machine.state();
        let output_name = CompilationPlan::output_name(self.entry);
        let output = self.deliver(out_dir, "pdf", &output_name);
        let log_name = format!("logs/{}", output_name.replace(".pdf", ".log"));
        let log = self.deliver(out_dir, "log", &log_name);

        let status = match state {
            PassState::Converged { .. } if output.is_some() => Status::Success,
            PassState::Aborted { reason, .. } if reason.is_soft() => Status::Partial,
            _ => Status::Failure,
        };
        if !state.is_terminal() {
            warn!(entry = %self.entry.file, ?state, "plan ended in a non-terminal state");
        }

        PlanOutcome {
            entry: self.entry.file.clone(),
            engine: self.entry.engine,
            passes: state.passes(),
            state,
            status,
            aux_steps: std::mem::take(&mut self.aux_runs),
            output,
            log,
            notes: std::mem::take(&mut self.notes),
            run_seqs: self.runs.iter().map(|r| r.seq).collect(),
            runs: self.runs,
            logs: self.logs,
        }
    }

    fn deliver(&mut self, out_dir: &Path, ext: &str, name: &str) -> Option<String> {
        let source = self.job_file(ext);
        if !source.is_file() {
            return None;
        }
        let target = out_dir.join(name);
        let copied = target
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::copy(&source, &target));
        match copied {
            Ok(_) => Some(name.to_string()),
            Err(e) => {
                warn!(file = %target.display(), error = %e, "failed to deliver file");
                self.notes.push(format!("failed to deliver {}: {}", name, e));
                None
            }
        }
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
