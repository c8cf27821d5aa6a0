//! Rerun and auxiliary-processor detection.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Auxiliary processor requested between two engine passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuxKind {
    /// Classic bibliography compiler, reads `<job>.aux`
    Bibtex,
    /// biblatex backend, reads `<job>.bcf`
    Biber,
    /// Index generator, reads `<job>.idx`
    Makeindex,
}

impl AuxKind {
    /// Default processor binary name
    pub fn processor(&self) -> &'static str {
        match self {
            AuxKind::Bibtex => "bibtex",
            AuxKind::Biber => "biber",
            AuxKind::Makeindex => "makeindex",
        }
    }

    /// Extension of the file the processor consumes
    pub fn input_extension(&self) -> &'static str {
        match self {
            AuxKind::Bibtex => "aux",
            AuxKind::Biber => "bcf",
            AuxKind::Makeindex => "idx",
        }
    }

    /// Whether this regenerates bibliography data
    pub fn is_bibliography(&self) -> bool {
        matches!(self, AuxKind::Bibtex | AuxKind::Biber)
    }
}

/// Capability the orchestrator uses to read engine logs.
///
/// Implementations decide what counts as "rerun needed" for a given engine
/// family; the state machine only sees the answers.
pub trait LogSignals: Send + Sync {
    /// True when the log says cross-reference or citation data changed.
    fn signals_rerun(&self, log_text: &str) -> bool;

    /// The auxiliary processor the log asks for, if any.
    fn requests_aux_pass(&self, log_text: &str) -> Option<AuxKind>;
}

const RERUN_NEEDLES: &[&str] = &[
    "Rerun to get",
    "Please rerun LaTeX",
    "Rerun LaTeX",
    "may have changed. Rerun",
    "Citation(s) may have changed",
];

/// Log heuristics for the LaTeX family and plain TeX.
#[derive(Debug, Clone)]
pub struct TexLogSignals {
    rerun_needles: Vec<String>,
}

impl Default for TexLogSignals {
    fn default() -> Self {
        Self {
            rerun_needles: RERUN_NEEDLES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TexLogSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds another substring that marks a rerun request.
    pub fn with_rerun_needle(mut self, needle: impl Into<String>) -> Self {
        self.rerun_needles.push(needle.into());
        self
    }
}

fn missing_bbl() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^No file .+\.bbl\.\s*$").ok())
        .as_ref()
}

fn missing_ind() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^No file .+\.ind\.\s*$").ok())
        .as_ref()
}

fn any_line(re: Option<&Regex>, log_text: &str) -> bool {
    re.map(|re| log_text.lines().any(|line| re.is_match(line)))
        .unwrap_or(false)
}

impl LogSignals for TexLogSignals {
    fn signals_rerun(&self, log_text: &str) -> bool {
        log_text
            .lines()
            .any(|line| self.rerun_needles.iter().any(|n| line.contains(n.as_str())))
    }

    fn requests_aux_pass(&self, log_text: &str) -> Option<AuxKind> {
        if log_text.contains("Please (re)run Biber") {
            return Some(AuxKind::Biber);
        }
        if log_text.contains("Please (re)run BibTeX") || any_line(missing_bbl(), log_text) {
            return Some(AuxKind::Bibtex);
        }
        if any_line(missing_ind(), log_text) {
            return Some(AuxKind::Makeindex);
        }
        None
    }
}
