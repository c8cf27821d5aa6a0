//! End-to-end compilation against a fake toolchain.

#![cfg(unix)]

mod fixtures;

use std::fs;

use fixtures::{tree, FakeToolchain, ARTICLE, ARTICLE_WITH_BIBLIOGRAPHY};
use tempfile::TempDir;
use tex_lane::orchestrator::{AbortReason, PassState};
use tex_lane::outcome::{ExitCode, Outcome, Status};
use tex_lane::resolver::Found;
use tex_lane::pipeline::{CompileRequest, Pipeline};
use tex_lane_logscan::{AuxKind, ErrorKind};
use tex_lane_sandbox::Stage;

fn request(src: &TempDir, out: &TempDir) -> CompileRequest {
    let mut request = CompileRequest::new(src.path(), out.path());
    request.archive_name = Some("paper.tar.gz".to_string());
    request
}

#[test]
fn test_bibtex_document_takes_five_runs() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_BIBTEX_RERUN);
    let src = tree(&[("main.tex", ARTICLE_WITH_BIBLIOGRAPHY), ("refs.bib", "@book{knuth}\n")]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, persisted) = pipeline.compile(&request(&src, &out)).unwrap();

    let stages: Vec<Stage> = outcome.runs.iter().map(|r| r.tag.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Resolve,
            Stage::Engine,
            Stage::Auxiliary,
            Stage::Engine,
            Stage::Engine
        ]
    );
    let seqs: Vec<u64> = outcome.runs.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    assert!(outcome.runs.iter().all(|r| r.succeeded()));

    assert_eq!(outcome.status, Status::Success);
    assert_eq!(outcome.exit_code(), ExitCode::Success);
    assert!(outcome.errors.is_empty());

    let plan = &outcome.plans[0];
    assert_eq!(plan.entry, "main.tex");
    assert_eq!(plan.state, PassState::Converged { passes: 3 });
    assert_eq!(plan.aux_steps, vec![AuxKind::Bibtex]);
    assert_eq!(plan.output.as_deref(), Some("main.pdf"));
    assert_eq!(outcome.outputs, vec!["main.pdf".to_string()]);

    assert!(out.path().join("main.pdf").is_file());
    assert!(out.path().join("logs/main.log").is_file());
    assert!(!out.path().join(".work").exists());

    // The resolver found the class in the toolchain and the bibliography in the tree
    let report = outcome.dependency_report.as_ref().unwrap();
    assert!(report.missing.is_empty());
    assert!(report.used.contains("refs.bib"));

    let record = fs::read_to_string(&persisted.record).unwrap();
    let reread = Outcome::from_json(&record).unwrap();
    assert_eq!(reread.runs.len(), 5);
    assert_eq!(reread.status, Status::Success);
    assert!(persisted.bundle.unwrap().ends_with("paper.outcome.tar.gz"));
}

#[test]
fn test_missing_package_is_classified_failure() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_MISSING_PACKAGE);
    let src = tree(&[(
        "main.tex",
        "\\documentclass{article}\n\\usepackage{foo}\n\\begin{document}\nx\n\\end{document}\n",
    )]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    assert_eq!(outcome.status, Status::Failure);
    assert_eq!(outcome.exit_code(), ExitCode::Failure);
    assert_eq!(
        outcome.plans[0].state,
        PassState::Aborted {
            reason: AbortReason::ToolHardFailure,
            passes: 1
        }
    );
    assert_eq!(outcome.errors.len(), 1);
    let error = &outcome.errors[0];
    assert_eq!(error.kind, ErrorKind::MissingPackage);
    assert_eq!(error.subject.as_deref(), Some("foo.sty"));
    assert_eq!(error.stage, Stage::Engine);
    assert!(error.excerpt.contains("foo.sty"));

    // The log is delivered even without output
    assert!(outcome.plans[0].output.is_none());
    assert!(out.path().join("logs/main.log").is_file());
}

#[test]
fn test_pass_budget_is_a_hard_bound() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_ALWAYS_RERUN);
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();

    let mut config = toolchain.config();
    config.max_passes = 3;
    let pipeline = Pipeline::new(config);
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    let engine_runs = outcome
        .runs
        .iter()
        .filter(|r| r.tag.stage == Stage::Engine)
        .count();
    assert_eq!(engine_runs, 3);
    assert_eq!(
        outcome.plans[0].state,
        PassState::Aborted {
            reason: AbortReason::PassBudgetExhausted,
            passes: 3
        }
    );
    assert_eq!(outcome.status, Status::Partial);
    assert_eq!(outcome.exit_code(), ExitCode::Partial);
    // Rerun requests are not failures
    assert!(outcome.errors.is_empty());
}

#[test]
fn test_missing_engine_is_setup_failure() {
    let toolchain = FakeToolchain::new();
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    assert_eq!(outcome.status, Status::Failure);
    let engine_error = outcome
        .errors
        .iter()
        .find(|e| e.stage == Stage::Engine)
        .unwrap();
    assert_eq!(engine_error.kind, ErrorKind::SandboxSetupFailed);
}

#[test]
fn test_binary_outside_profiles_is_rejected() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_CLEAN);
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();

    let mut config = toolchain.config();
    config.sandbox.toolchain_prefixes = vec!["/nonexistent/texlive".into()];
    let pipeline = Pipeline::new(config);
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    assert_eq!(outcome.status, Status::Failure);
    assert!(outcome
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::UnknownBinaryLocation));
}

#[test]
fn test_manifest_entries_compile_and_combine_in_order() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_CLEAN);
    let manifest = r#"{
        "compilation": {"compiler": "pdflatex"},
        "sources": [
            {"name": "b.tex", "usage": "toplevel"},
            {"name": "a.tex", "usage": "toplevel"}
        ],
        "postprocess": {"assembling_files": ["b.tex", "a.tex", "missing.pdf"]}
    }"#;
    let src = tree(&[
        ("00README.json", manifest),
        ("a.tex", ARTICLE),
        ("b.tex", ARTICLE),
    ]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    let entries: Vec<&str> = outcome.plans.iter().map(|p| p.entry.as_str()).collect();
    assert_eq!(entries, vec!["b.tex", "a.tex"]);
    assert!(outcome
        .plans
        .iter()
        .all(|p| p.state == PassState::Converged { passes: 1 }));

    assert_eq!(outcome.postprocess.len(), 1);
    assert!(outcome.postprocess[0].succeeded);
    assert_eq!(outcome.postprocess[0].target, "paper.combined.pdf");
    assert!(out.path().join("paper.combined.pdf").is_file());
    assert!(outcome.outputs.contains(&"paper.combined.pdf".to_string()));

    // A missing assembling file is a warning, not a failure
    assert_eq!(outcome.status, Status::Success);
    assert!(outcome.warnings.iter().any(|w| matches!(
        w,
        tex_lane::submission::SubmissionWarning::AssemblingFileNotFound { name } if name == "missing.pdf"
    )));
}

#[test]
fn test_run_records_are_complete() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_CLEAN);
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    let engine = outcome
        .runs
        .iter()
        .find(|r| r.tag.stage == Stage::Engine)
        .unwrap();
    assert_eq!(engine.tag.pass, Some(1));
    assert_eq!(engine.tag.entry.as_deref(), Some("main.tex"));
    assert!(engine.args.contains(&"-interaction=batchmode".to_string()));
    assert!(engine.args.contains(&"-output-format=pdf".to_string()));
    assert_eq!(engine.args.last().map(String::as_str), Some("main.tex"));
    assert!(engine.env_keys.contains(&"max_print_line".to_string()));
    assert!(engine.binary.is_some());
    assert!(engine.ended_at >= engine.started_at);
}

#[test]
fn test_injected_database_replaces_helper() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_CLEAN);
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();

    let db = tex_lane::resolver::StaticToolchainDb::new().with_file("article.cls", "/texmf/article.cls");
    let pipeline = Pipeline::new(toolchain.config()).with_toolchain_db(std::sync::Arc::new(db));
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    assert_eq!(outcome.status, Status::Success);
    assert!(outcome.runs.iter().all(|r| r.tag.stage != Stage::Resolve));
    assert!(outcome.dependency_report.unwrap().missing.is_empty());
}

#[test]
fn test_repeated_aux_request_stops_the_loop() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_BIBTEX_LOOP);
    let src = tree(&[("main.tex", ARTICLE_WITH_BIBLIOGRAPHY), ("refs.bib", "@book{knuth}\n")]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    let plan = &outcome.plans[0];
    assert_eq!(
        plan.state,
        PassState::Aborted {
            reason: AbortReason::AuxNotConverging,
            passes: 2
        }
    );
    assert_eq!(plan.aux_steps, vec![AuxKind::Bibtex]);
    assert_eq!(outcome.status, Status::Partial);
    assert_eq!(outcome.exit_code(), ExitCode::Partial);
}

#[test]
fn test_overall_budget_cancels_running_engine() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_SLOW);
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();

    let mut config = toolchain.config();
    config.timeouts.overall_seconds = 1;
    config.timeouts.invocation_seconds = 1;
    config.timeouts.termination_grace_seconds = 1;
    let pipeline = Pipeline::new(config);
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    assert_eq!(
        outcome.plans[0].state,
        PassState::Aborted {
            reason: AbortReason::Cancelled,
            passes: 1
        }
    );
    assert_eq!(outcome.status, Status::Partial);
    // The interrupted run is still on record
    let engine = outcome
        .runs
        .iter()
        .find(|r| r.tag.stage == Stage::Engine)
        .unwrap();
    assert!(!engine.succeeded());
}

#[test]
fn test_dvi_output_retries_dvips_without_hyperdvi() {
    let toolchain = FakeToolchain::new();
    let latex = toolchain.script("latex", &format!("{}{}", fixtures::JOB_PRELUDE, fixtures::LATEX_DVI));
    toolchain.script("dvips", fixtures::DVIPS_NO_HYPER);
    toolchain.script("ps2pdf", fixtures::PS2PDF);
    let src = tree(&[
        (
            "main.tex",
            "\\documentclass{article}\n\\usepackage{graphicx}\n\\begin{document}\n\\includegraphics{fig.eps}\n\\end{document}\n",
        ),
        ("fig.eps", "%!PS-Adobe-3.0 EPSF-3.0\n"),
    ]);
    let out = TempDir::new().unwrap();

    let mut config = toolchain.config();
    config.engines.latex = latex.display().to_string();
    let pipeline = Pipeline::new(config);
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    let stages: Vec<Stage> = outcome.runs.iter().map(|r| r.tag.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Resolve,
            Stage::Engine,
            Stage::Convert,
            Stage::Convert,
            Stage::Convert
        ]
    );
    let hyper = |i: usize| outcome.runs[i].args.contains(&"-z".to_string());
    assert!(hyper(2));
    assert!(!outcome.runs[2].succeeded());
    assert!(!hyper(3));
    assert!(outcome.runs[3].succeeded());
    assert!(outcome.runs[3].args.contains(&"-R2".to_string()));
    assert_eq!(outcome.runs[4].args, vec!["main.ps".to_string(), "main.pdf".to_string()]);

    assert_eq!(outcome.plans[0].state, PassState::Converged { passes: 1 });
    assert_eq!(outcome.plans[0].output.as_deref(), Some("main.pdf"));
    assert_eq!(outcome.status, Status::Success);
    assert!(out.path().join("main.pdf").is_file());
}

#[test]
fn test_failing_entry_does_not_affect_other_plan() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(
        r#"
if [ "$job" = bad ]; then
  printf 'This is pdfTeX\n! Emergency stop.\n' > "$job.log"
  exit 1
fi
printf 'This is pdfTeX\nOutput written on %s.pdf (1 page).\n' "$job" > "$job.log"
printf '%%PDF-1.5\n' > "$job.pdf"
exit 0
"#,
    );
    let manifest = r#"{
        "sources": [
            {"name": "good.tex", "usage": "toplevel"},
            {"name": "bad.tex", "usage": "toplevel"}
        ]
    }"#;
    let src = tree(&[
        ("00README.json", manifest),
        ("good.tex", ARTICLE),
        ("bad.tex", ARTICLE),
    ]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    let good = &outcome.plans[0];
    assert_eq!(good.entry, "good.tex");
    assert_eq!(good.state, PassState::Converged { passes: 1 });
    assert_eq!(good.status, Status::Success);
    assert_eq!(good.output.as_deref(), Some("good.pdf"));
    assert!(out.path().join("good.pdf").is_file());

    let bad = &outcome.plans[1];
    assert_eq!(bad.entry, "bad.tex");
    assert_eq!(
        bad.state,
        PassState::Aborted {
            reason: AbortReason::ToolHardFailure,
            passes: 1
        }
    );
    assert_eq!(bad.status, Status::Failure);
    assert!(outcome
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::EmergencyStop && e.entry.as_deref() == Some("bad.tex")));

    assert_eq!(outcome.status, Status::Failure);
}

#[test]
fn test_missing_bibliography_database_is_reported() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_BIBTEX_RERUN);
    toolchain.script("bibtex", fixtures::BIBTEX_MISSING_DATABASE);
    toolchain.unknown_names(&["refs"]);
    let src = tree(&[("main.tex", ARTICLE_WITH_BIBLIOGRAPHY)]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    let report = outcome.dependency_report.as_ref().unwrap();
    assert!(report.is_missing("refs"));
    let refs = report.missing.iter().find(|r| r.name == "refs").unwrap();
    assert_eq!(refs.found, Found::NotFound);

    assert_eq!(
        outcome.plans[0].state,
        PassState::Aborted {
            reason: AbortReason::ToolHardFailure,
            passes: 1
        }
    );
    assert_eq!(outcome.status, Status::Failure);
    let error = outcome
        .errors
        .iter()
        .find(|e| e.stage == Stage::Auxiliary)
        .unwrap();
    assert_eq!(error.kind, ErrorKind::MissingFile);
    assert_eq!(error.subject.as_deref(), Some("refs.bib"));
}

#[test]
fn test_engine_error_with_rerun_request_continues() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_FAILS_THEN_RECOVERS);
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    assert_eq!(outcome.plans[0].state, PassState::Converged { passes: 2 });
    assert_eq!(outcome.status, Status::Success);
    assert!(out.path().join("main.pdf").is_file());
}

#[test]
fn test_engine_error_without_output_stops() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(
        r#"
printf 'This is pdfTeX\nRerun to get cross-references right.\n' > "$job.log"
exit 1
"#,
    );
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, _) = pipeline.compile(&request(&src, &out)).unwrap();

    assert_eq!(
        outcome.plans[0].state,
        PassState::Aborted {
            reason: AbortReason::ToolHardFailure,
            passes: 1
        }
    );
    assert_eq!(outcome.status, Status::Failure);
}

#[test]
fn test_unusable_working_directory_still_writes_outcome() {
    let toolchain = FakeToolchain::new();
    toolchain.engine(fixtures::ENGINE_CLEAN);
    let src = tree(&[("main.tex", ARTICLE)]);
    let out = TempDir::new().unwrap();
    fs::write(out.path().join(".work"), "not a directory").unwrap();

    let pipeline = Pipeline::new(toolchain.config());
    let (outcome, persisted) = pipeline.compile(&request(&src, &out)).unwrap();

    assert_eq!(outcome.status, Status::Failure);
    assert!(outcome
        .fatal
        .as_deref()
        .unwrap_or("")
        .starts_with("could not create working directory"));
    // The resolver run happened before the failure and stays on record
    assert!(outcome.runs.iter().any(|r| r.tag.stage == Stage::Resolve));
    assert!(outcome.plans.is_empty());

    let reread = Outcome::from_json(&fs::read_to_string(&persisted.record).unwrap()).unwrap();
    assert_eq!(reread.status, Status::Failure);
}
