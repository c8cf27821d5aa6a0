//! Compilation orchestrator
//!
//! Drives every entry of a [`CompilationPlan`] through the pass state machine
//! in its own working copy, then runs the post-processing stage. Plans are
//! independent and run on a bounded pool; a watchdog turns an expired
//! submission budget into a sandbox-wide cancellation.
//!
//! Nothing here returns an error for a plan: failures come back as
//! [`PlanOutcome`] data with the runs that led to them.

mod pass;
mod postprocess;
pub mod state;
pub mod workspace;

pub use postprocess::{PostProcessKind, PostProcessReport, PostProcessStep};
pub use state::{AbortReason, PassMachine, PassState, PassStateError, TerminalState};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use tex_lane_logscan::{AuxKind, LogSignals};
use tex_lane_sandbox::{Run, Sandbox};

use crate::outcome::Status;
use crate::submission::{CompilationPlan, Engine, PlanEntry, Submission};
use crate::timeout::TimeoutEnforcer;
use pass::EntryDriver;

/// How often the watchdog checks the submission budget.
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(50);

/// Binaries used for each tool, by name or absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolBinaries {
    pub tex: String,
    pub latex: String,
    pub pdflatex: String,
    pub bibtex: String,
    pub biber: String,
    pub makeindex: String,
    pub dvips: String,
    pub ps2pdf: String,
}

impl Default for ToolBinaries {
    fn default() -> Self {
        Self {
            tex: Engine::PlainTex.default_binary().to_string(),
            latex: Engine::Latex.default_binary().to_string(),
            pdflatex: Engine::PdfLatex.default_binary().to_string(),
            bibtex: AuxKind::Bibtex.processor().to_string(),
            biber: AuxKind::Biber.processor().to_string(),
            makeindex: AuxKind::Makeindex.processor().to_string(),
            dvips: "dvips".to_string(),
            ps2pdf: "ps2pdf".to_string(),
        }
    }
}

impl ToolBinaries {
    pub fn engine(&self, engine: Engine) -> &str {
        match engine {
            Engine::PlainTex => &self.tex,
            Engine::Latex => &self.latex,
            Engine::PdfLatex => &self.pdflatex,
        }
    }

    pub fn aux(&self, kind: AuxKind) -> &str {
        match kind {
            AuxKind::Bibtex => &self.bibtex,
            AuxKind::Biber => &self.biber,
            AuxKind::Makeindex => &self.makeindex,
        }
    }
}

/// External commands of the post-processing stage.
///
/// `combine_command` is called as `<cmd...> <input.pdf...> <output.pdf>`,
/// `stamp_command` as `<cmd...> <input.pdf> <output.pdf>`. An empty command
/// disables the step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessCommands {
    pub combine_command: Vec<String>,
    pub stamp_command: Vec<String>,
}

impl Default for PostProcessCommands {
    fn default() -> Self {
        Self {
            combine_command: vec!["pdfunite".to_string()],
            stamp_command: Vec::new(),
        }
    }
}

/// Orchestrator knobs, taken from the effective configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_passes: u32,
    /// Upper bound on concurrently compiled plans
    pub jobs: usize,
    pub tools: ToolBinaries,
    pub postprocess: PostProcessCommands,
    /// Apply source fixups to working copies
    pub fixups: bool,
    /// Extra read-only paths granted to every invocation
    pub extra_read_only: Vec<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_passes: 5,
            jobs: 1,
            tools: ToolBinaries::default(),
            postprocess: PostProcessCommands::default(),
            fixups: false,
            extra_read_only: Vec::new(),
        }
    }
}

/// Result of compiling one plan entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub entry: String,
    pub engine: Engine,
    pub state: PassState,
    pub status: Status,
    pub passes: u32,

    /// Auxiliary processors run between passes, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aux_steps: Vec<AuxKind>,

    /// Delivered PDF, relative to the output directory
    pub output: Option<String>,

    /// Delivered engine log, relative to the output directory
    pub log: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,

    /// Sequence numbers of this plan's runs
    pub run_seqs: Vec<u64>,

    #[serde(skip)]
    pub runs: Vec<Run>,

    /// Log text per run sequence number, for error classification
    #[serde(skip)]
    pub logs: BTreeMap<u64, String>,
}

impl PlanOutcome {
    /// Failure record for an entry whose driver never reported back.
    pub fn unreported(entry: &PlanEntry, note: &str) -> Self {
        Self {
            entry: entry.file.clone(),
            engine: entry.engine,
            state: PassState::Aborted {
                reason: AbortReason::ToolHardFailure,
                passes: 0,
            },
            status: Status::Failure,
            passes: 0,
            aux_steps: Vec::new(),
            output: None,
            log: None,
            notes: vec![note.to_string()],
            run_seqs: Vec::new(),
            runs: Vec::new(),
            logs: BTreeMap::new(),
        }
    }
}

/// Compiles plans through a shared sandbox.
pub struct Orchestrator<'a> {
    sandbox: &'a Sandbox,
    signals: &'a dyn LogSignals,
    enforcer: &'a TimeoutEnforcer,
    settings: &'a OrchestratorSettings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        sandbox: &'a Sandbox,
        signals: &'a dyn LogSignals,
        enforcer: &'a TimeoutEnforcer,
        settings: &'a OrchestratorSettings,
    ) -> Self {
        Self {
            sandbox,
            signals,
            enforcer,
            settings,
        }
    }

    /// Compiles every entry of `plan`, each in `work_root/<nn>-<entry>`, and
    /// delivers outputs and logs into `out_dir`.
    ///
    /// Outcomes come back in plan order regardless of completion order.
    pub fn compile(
        &self,
        submission: &Submission,
        plan: &CompilationPlan,
        work_root: &Path,
        out_dir: &Path,
    ) -> Vec<PlanOutcome> {
        let total = plan.entries.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = self.pool_size(total);
        info!(plans = total, workers, "compiling");

        let next = AtomicUsize::new(0);
        let done = AtomicBool::new(false);
        let slots: Mutex<Vec<Option<PlanOutcome>>> = Mutex::new(vec![None; total]);

        let (next, done, slots_ref) = (&next, &done, &slots);
        std::thread::scope(|scope| {
            scope.spawn(move || self.watchdog(done));

            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(entry) = plan.entries.get(index) else {
                            break;
                        };
                        let dir = workspace::plan_dir(work_root, index, &entry.file);
                        let driver = EntryDriver::new(self, plan, entry, dir);
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            driver.run(submission, out_dir)
                        }))
                        .unwrap_or_else(|_| {
                            warn!(entry = %entry.file, "plan driver panicked");
                            PlanOutcome::unreported(entry, "plan driver panicked")
                        });
                        let mut slots = match slots_ref.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        slots[index] = Some(outcome);
                    })
                })
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    warn!("plan worker panicked");
                }
            }
            done.store(true, Ordering::SeqCst);
        });

        let slots = match slots.into_inner() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        collect_outcomes(plan, slots)
    }

    /// Runs the combine and stamp steps over delivered outputs.
    pub fn postprocess(
        &self,
        submission: &mut Submission,
        plan: &CompilationPlan,
        outcomes: &[PlanOutcome],
        out_dir: &Path,
    ) -> PostProcessReport {
        postprocess::run(self, submission, plan, outcomes, out_dir)
    }

    fn pool_size(&self, plans: usize) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.settings.jobs.max(1).min(available).min(plans)
    }

    fn watchdog(&self, done: &AtomicBool) {
        while !done.load(Ordering::SeqCst) {
            if self.enforcer.check().is_timeout() && !self.sandbox.is_cancelled() {
                warn!(
                    elapsed_ms = self.enforcer.elapsed().as_millis() as u64,
                    "submission budget expired, cancelling"
                );
                self.sandbox.request_cancel();
            }
            std::thread::sleep(WATCHDOG_INTERVAL);
        }
    }
}

/// One outcome per plan entry, in plan order; empty slots become failures.
fn collect_outcomes(plan: &CompilationPlan, slots: Vec<Option<PlanOutcome>>) -> Vec<PlanOutcome> {
    plan.entries
        .iter()
        .zip(slots)
        .map(|(entry, slot)| {
            slot.unwrap_or_else(|| {
                warn!(entry = %entry.file, "plan produced no outcome");
                PlanOutcome::unreported(entry, "worker panicked")
            })
        })
        .collect()
}
