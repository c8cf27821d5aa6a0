//! Post-processing stage: combining assembling files and stamping outputs.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use tex_lane_sandbox::{Invocation, Run, RunTag, Stage};

use super::{Orchestrator, PlanOutcome};
use crate::submission::{archive_base_name, CompilationPlan, Submission, SubmissionWarning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcessKind {
    Combine,
    Stamp,
}

/// One post-processing action and how it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessStep {
    pub kind: PostProcessKind,
    /// File produced or rewritten, relative to the output directory
    pub target: String,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PostProcessReport {
    pub steps: Vec<PostProcessStep>,
    /// Outputs created by this stage, relative to the output directory
    pub outputs: Vec<String>,
    pub runs: Vec<Run>,
}

impl PostProcessReport {
    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.succeeded)
    }
}

pub(super) fn run(
    orch: &Orchestrator<'_>,
    submission: &mut Submission,
    plan: &CompilationPlan,
    outcomes: &[PlanOutcome],
    out_dir: &Path,
) -> PostProcessReport {
    let mut report = PostProcessReport::default();
    if !plan.postprocess.assembling_files.is_empty() {
        combine(orch, submission, plan, outcomes, out_dir, &mut report);
    }
    if plan.postprocess.stamp {
        let mut targets: Vec<String> = outcomes.iter().filter_map(|o| o.output.clone()).collect();
        targets.extend(report.outputs.iter().cloned());
        stamp(orch, &targets, out_dir, &mut report);
    }
    report
}

/// Where an assembling file name points: an entry's delivered output, a
/// delivered file, or a file of the tree.
fn locate(name: &str, submission: &Submission, outcomes: &[PlanOutcome], out_dir: &Path) -> Option<PathBuf> {
    if let Some(output) = outcomes
        .iter()
        .find(|o| o.entry == name)
        .and_then(|o| o.output.as_ref())
    {
        return Some(out_dir.join(output));
    }
    let delivered = out_dir.join(name);
    if delivered.is_file() {
        return Some(delivered);
    }
    if submission.contains(name) {
        return Some(submission.abs(name));
    }
    None
}

fn combine(
    orch: &Orchestrator<'_>,
    submission: &mut Submission,
    plan: &CompilationPlan,
    outcomes: &[PlanOutcome],
    out_dir: &Path,
    report: &mut PostProcessReport,
) {
    let mut inputs = Vec::new();
    for name in &plan.postprocess.assembling_files {
        match locate(name, submission, outcomes, out_dir) {
            Some(path) => inputs.push(path.display().to_string()),
            None => {
                warn!(file = %name, "assembling file not found");
                submission.warn(SubmissionWarning::AssemblingFileNotFound { name: name.clone() });
            }
        }
    }
    let target = format!("{}.combined.pdf", archive_base_name(&submission.archive_name));
    if inputs.is_empty() {
        return;
    }
    let Some((program, base_args)) = orch.settings.postprocess.combine_command.split_first() else {
        report.steps.push(PostProcessStep {
            kind: PostProcessKind::Combine,
            target,
            succeeded: false,
            run_seq: None,
            note: Some("no combine command configured".to_string()),
        });
        return;
    };

    let mut args: Vec<String> = base_args.to_vec();
    args.extend(inputs);
    args.push(target.clone());
    let invocation = Invocation::new(RunTag::new(Stage::PostProcess), program.clone(), out_dir)
        .args(args)
        .allow_read(submission.root.clone())
        .timeout(orch.enforcer.invocation_budget());
    let run = orch.sandbox.run(&invocation);
    let succeeded = run.succeeded() && out_dir.join(&target).is_file();
    info!(target = %target, exit_code = run.exit_code, succeeded, "combine step finished");

    report.steps.push(PostProcessStep {
        kind: PostProcessKind::Combine,
        target: target.clone(),
        succeeded,
        run_seq: Some(run.seq),
        note: None,
    });
    if succeeded {
        report.outputs.push(target);
    }
    report.runs.push(run);
}

fn stamp(orch: &Orchestrator<'_>, targets: &[String], out_dir: &Path, report: &mut PostProcessReport) {
    let Some((program, base_args)) = orch.settings.postprocess.stamp_command.split_first() else {
        warn!("stamping requested but no stamp command is configured");
        for target in targets {
            report.steps.push(PostProcessStep {
                kind: PostProcessKind::Stamp,
                target: target.clone(),
                succeeded: true,
                run_seq: None,
                note: Some("skipped: no stamp command configured".to_string()),
            });
        }
        return;
    };

    for target in targets {
        let stamped = format!("{}.stamped", target);
        let mut args: Vec<String> = base_args.to_vec();
        args.extend([target.clone(), stamped.clone()]);
        let invocation = Invocation::new(RunTag::new(Stage::PostProcess), program.clone(), out_dir)
            .args(args)
            .timeout(orch.enforcer.invocation_budget());
        let run = orch.sandbox.run(&invocation);

        let mut note = None;
        let mut succeeded = run.succeeded() && out_dir.join(&stamped).is_file();
        if succeeded {
            if let Err(e) = fs::rename(out_dir.join(&stamped), out_dir.join(target)) {
                note = Some(format!("could not replace output: {}", e));
                succeeded = false;
            }
        }
        info!(target = %target, exit_code = run.exit_code, succeeded, "stamp step finished");
        report.steps.push(PostProcessStep {
            kind: PostProcessKind::Stamp,
            target: target.clone(),
            succeeded,
            run_seq: Some(run.seq),
            note,
        });
        report.runs.push(run);
    }
}
