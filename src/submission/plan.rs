//! Compilation plan: engine, entry files, post-processing directives.

use serde::{Deserialize, Serialize};

use super::FileAttributes;

/// Supported engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// Plain TeX to DVI, then dvips and ps2pdf
    PlainTex,
    /// LaTeX to DVI, then dvips and ps2pdf
    Latex,
    /// pdfLaTeX straight to PDF
    #[default]
    PdfLatex,
}

/// A compiler value outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported engine: {0}")]
pub struct UnsupportedEngine(pub String);

impl Engine {
    /// Parses a manifest compiler value.
    pub fn from_compiler(value: &str) -> Result<Self, UnsupportedEngine> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tex" | "etex" | "etex+dvips_ps2pdf" | "tex+dvips_ps2pdf" => Ok(Engine::PlainTex),
            "latex" | "latex+dvips_ps2pdf" => Ok(Engine::Latex),
            "pdflatex" | "pdftex" | "pdflatex+pdf" => Ok(Engine::PdfLatex),
            _ => Err(UnsupportedEngine(value.to_string())),
        }
    }

    /// Canonical manifest spelling
    pub fn compiler_name(&self) -> &'static str {
        match self {
            Engine::PlainTex => "etex+dvips_ps2pdf",
            Engine::Latex => "latex+dvips_ps2pdf",
            Engine::PdfLatex => "pdflatex",
        }
    }

    /// Engine binary invoked for each pass
    pub fn default_binary(&self) -> &'static str {
        match self {
            Engine::PlainTex => "tex",
            Engine::Latex => "latex",
            Engine::PdfLatex => "pdflatex",
        }
    }

    /// Whether passes produce DVI that needs dvips and ps2pdf
    pub fn produces_dvi(&self) -> bool {
        matches!(self, Engine::PlainTex | Engine::Latex)
    }

    pub fn is_latex(&self) -> bool {
        matches!(self, Engine::Latex | Engine::PdfLatex)
    }

    /// Extension of the engine's direct output
    pub fn output_extension(&self) -> &'static str {
        if self.produces_dvi() {
            "dvi"
        } else {
            "pdf"
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.compiler_name())
    }
}

/// Post-processing directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcess {
    /// Stamp a watermark on the outputs
    #[serde(default)]
    pub stamp: bool,

    /// Outputs to combine into one document, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assembling_files: Vec<String>,
}

/// How the entry file was chosen among several candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakRule {
    /// Named by the manifest
    Manifest,
    /// Only one candidate existed
    Single,
    /// Base name matched the archive's base name
    ArchiveBaseName,
    /// Shallowest directory depth, then lexicographic order
    ShallowestLexicographic,
}

/// Audit record of entry selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieBreak {
    /// All plausible entry candidates, sorted
    pub candidates: Vec<String>,
    pub chosen: Vec<String>,
    pub rule: TieBreakRule,
    pub rationale: String,
}

/// One entry file to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub file: String,
    pub engine: Engine,
    pub attributes: FileAttributes,

    /// The file sets `\pdfoutput=1` itself
    #[serde(default)]
    pub pdfoutput_declared: bool,

    /// A matching `.bbl` ships with the sources, so the bibliography step is skipped
    #[serde(default)]
    pub prebuilt_bbl: bool,
}

impl PlanEntry {
    /// Job name the engine derives from the file name.
    pub fn job_name(&self) -> &str {
        super::stem_of(&self.file)
    }

    /// Directory of the entry, relative to the root (empty for top level).
    pub fn dir(&self) -> &str {
        match self.file.rfind('/') {
            Some(i) => &self.file[..i],
            None => "",
        }
    }
}

/// Frozen description of what to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationPlan {
    /// Engine selected for the submission as a whole
    pub engine: Engine,
    pub entries: Vec<PlanEntry>,
    pub font_maps: Vec<String>,
    pub postprocess: PostProcess,
    pub tie_break: Option<TieBreak>,
    /// Directories inside the tree searched for references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_dirs: Vec<String>,
}

impl CompilationPlan {
    /// Name of an entry's PDF in the output directory.
    ///
    /// Entries below the root carry their directory, flattened with `-`, so
    /// two `main.tex` files in different directories do not collide.
    pub fn output_name(entry: &PlanEntry) -> String {
        match entry.dir() {
            "" => format!("{}.pdf", entry.job_name()),
            dir => format!("{}-{}.pdf", dir.replace('/', "-"), entry.job_name()),
        }
    }

    pub fn entry_files(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.file.as_str()).collect()
    }
}
