//! Preflight classifier
//!
//! Reads the text sources of a [`Submission`], builds the local include
//! graph, and decides which files are entry points and which engine each
//! needs. The result is a frozen [`CompilationPlan`]. Classification is a
//! pure function of the tree and the manifest directives.

pub mod fixups;
mod scan;

pub use scan::{
    scan_text, strip_comments, FileScan, RefKind, Reference, DVI_ONLY_IMAGES, PDF_ONLY_IMAGES,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::manifest::Directives;
use crate::submission::{
    extension_of, normalize_rel, stem_of, CompilationPlan, Engine, FileRole, PlanEntry,
    RoleSource, Submission, SubmissionWarning, TieBreak, TieBreakRule,
};

/// Extensions of files scanned for markers and references.
pub const TEXT_EXTENSIONS: &[&str] = &["tex", "ltx", "sty", "cls", "clo"];

/// Extensions a top-level entry may have.
const ENTRY_EXTENSIONS: &[&str] = &["tex", "ltx"];

/// Support files consumed by the toolchain rather than delivered.
const SUPPORT_EXTENSIONS: &[&str] = &[
    "bib", "bst", "bbl", "bbx", "cbx", "lbx", "bcf", "def", "fd", "cfg", "ist", "map", "enc",
    "tfm", "pfb", "vf", "afm", "otf", "ttf", "aux", "toc", "ind", "idx", "log",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreflightError {
    #[error("no entry point found ({scanned} text files scanned)")]
    NoEntryPointFound { scanned: usize },
}

/// Document language of a candidate's include subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Latex,
    PlainTex,
    Unknown,
}

/// Graphics families used by a subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFamilies {
    pub pdf_only: bool,
    pub dvi_only: bool,
}

impl ImageFamilies {
    pub fn conflicting(&self) -> bool {
        self.pdf_only && self.dvi_only
    }
}

/// A plausible entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub path: String,
    pub language: Language,
    pub begin_document: bool,
    pub images: ImageFamilies,
    pub engine: Engine,
}

/// Everything preflight learned about the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    /// Per-file scans, in path order
    pub files: Vec<FileScan>,
    /// Local include graph: file to the tree files it references
    pub edges: BTreeMap<String, BTreeSet<String>>,
    pub candidates: Vec<Candidate>,
    /// In-tree search directories from `\graphicspath`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_dirs: Vec<String>,
}

impl PreflightReport {
    pub fn scan(&self, path: &str) -> Option<&FileScan> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }

    /// Every file referenced by some other file.
    pub fn referenced(&self) -> BTreeSet<&str> {
        self.edges
            .iter()
            .flat_map(|(from, to)| to.iter().filter(move |t| t.as_str() != from.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// `root` and every tree file reachable from it.
    pub fn subtree<'s>(&'s self, root: &'s str) -> Vec<&'s str> {
        let mut visited: BTreeSet<&'s str> = BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(path) = stack.pop() {
            if !visited.insert(path) {
                continue;
            }
            order.push(path);
            if let Some(next) = self.edges.get(path) {
                stack.extend(next.iter().rev().map(String::as_str));
            }
        }
        order
    }

    /// Language, images and engine for a subtree rooted at `path`.
    pub fn infer(&self, path: &str, sub: &Submission) -> Candidate {
        let mut latex = false;
        let mut plain = false;
        let mut begin_document = false;
        let mut images = ImageFamilies::default();
        for node in self.subtree(path) {
            let Some(scan) = self.scan(node) else {
                continue;
            };
            latex |= scan.latex_marker;
            plain |= scan.plain_marker;
            if node == path {
                begin_document = scan.begin_document;
            }
            let base = dir_of(node);
            for reference in scan.references.iter().filter(|r| r.kind == RefKind::Graphic) {
                let ext = self
                    .resolve_local(sub, reference, base)
                    .map(|p| extension_of(&p))
                    .unwrap_or_else(|| extension_of(&reference.name));
                if PDF_ONLY_IMAGES.contains(&ext.as_str()) {
                    images.pdf_only = true;
                } else if DVI_ONLY_IMAGES.contains(&ext.as_str()) {
                    images.dvi_only = true;
                }
            }
        }
        let language = if latex {
            Language::Latex
        } else if plain {
            Language::PlainTex
        } else {
            Language::Unknown
        };
        let engine = match language {
            Language::PlainTex => Engine::PlainTex,
            Language::Latex if images.dvi_only => Engine::Latex,
            Language::Latex | Language::Unknown => Engine::PdfLatex,
        };
        Candidate {
            path: path.to_string(),
            language,
            begin_document,
            images,
            engine,
        }
    }

    fn resolve_local(&self, sub: &Submission, reference: &Reference, base: &str) -> Option<String> {
        let mut exts = reference.kind.extensions(false);
        if reference.kind == RefKind::Graphic {
            exts.extend(reference.kind.extensions(true));
        }
        sub.lookup(&reference.name, &exts, base, &self.search_dirs)
            .or_else(|| {
                (!base.is_empty())
                    .then(|| sub.lookup(&reference.name, &exts, "", &self.search_dirs))
                    .flatten()
            })
    }
}

fn dir_of(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

fn depth_of(path: &str) -> usize {
    path.matches('/').count()
}

/// Marks executable files as ignored.
pub fn reject_executables(sub: &mut Submission) {
    let executables: Vec<String> = sub
        .files
        .values()
        .filter(|f| f.executable)
        .map(|f| f.path.clone())
        .collect();
    for name in executables {
        info!(file = %name, "rejecting executable file");
        sub.set_role(&name, FileRole::Ignored, RoleSource::Preflight);
        sub.warn(SubmissionWarning::ExecutableFile { name });
    }
}

/// Scans every text source and builds the local include graph.
pub fn inspect(sub: &Submission) -> PreflightReport {
    let mut report = PreflightReport::default();

    for file in sub.files.values() {
        if file.role == FileRole::Ignored || !TEXT_EXTENSIONS.contains(&file.extension().as_str()) {
            continue;
        }
        let text = match std::fs::read(sub.abs(&file.path)) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                let mut scan = FileScan {
                    path: file.path.clone(),
                    ..Default::default()
                };
                scan.issues.push(format!("unreadable: {}", e));
                report.files.push(scan);
                continue;
            }
        };
        report.files.push(scan_text(&file.path, &text));
    }

    for scan in &report.files {
        for dir in &scan.graphicspath {
            let Some(dir) = normalize_rel(dir) else {
                continue;
            };
            if !report.search_dirs.contains(&dir) {
                report.search_dirs.push(dir);
            }
        }
    }

    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for scan in &report.files {
        let base = dir_of(&scan.path);
        let targets: BTreeSet<String> = scan
            .references
            .iter()
            .filter_map(|r| report.resolve_local(sub, r, base))
            .filter(|t| *t != scan.path)
            .collect();
        edges.insert(scan.path.clone(), targets);
    }
    report.edges = edges;

    let referenced = report.referenced();
    let mut candidates = Vec::new();
    for scan in &report.files {
        if !ENTRY_EXTENSIONS.contains(&extension_of(&scan.path).as_str())
            || referenced.contains(scan.path.as_str())
        {
            continue;
        }
        let candidate = report.infer(&scan.path, sub);
        if candidate.language != Language::Unknown {
            candidates.push(candidate);
        }
    }
    report.candidates = candidates;
    debug!(
        files = report.files.len(),
        candidates = report.candidates.len(),
        "preflight inspection done"
    );
    report
}

fn sort_key(path: &str) -> (String, &str) {
    (path.to_ascii_lowercase(), path)
}

/// Picks one entry among several candidates.
///
/// Rules, in order: base name equal to the archive's; shallowest directory;
/// then case-insensitive and exact lexicographic order.
pub fn tie_break(candidates: &[Candidate], archive_name: &str) -> Option<TieBreak> {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| sort_key(&a.path).cmp(&sort_key(&b.path)));
    let all: Vec<String> = sorted.iter().map(|c| c.path.clone()).collect();

    if let [only] = sorted.as_slice() {
        return Some(TieBreak {
            candidates: all,
            chosen: vec![only.path.clone()],
            rule: TieBreakRule::Single,
            rationale: format!("{} is the only entry candidate", only.path),
        });
    }

    let by_archive: Vec<&Candidate> = sorted
        .iter()
        .copied()
        .filter(|c| stem_of(&c.path).eq_ignore_ascii_case(archive_name))
        .collect();
    let (pool, rule) = if by_archive.is_empty() {
        (sorted.clone(), TieBreakRule::ShallowestLexicographic)
    } else {
        (by_archive, TieBreakRule::ArchiveBaseName)
    };

    let min_depth = pool.iter().map(|c| depth_of(&c.path)).min()?;
    let shallow: Vec<&Candidate> = pool
        .into_iter()
        .filter(|c| depth_of(&c.path) == min_depth)
        .collect();
    let chosen = shallow.first()?;

    let rationale = match rule {
        TieBreakRule::ArchiveBaseName => format!(
            "{} of {} candidates; base name matches archive '{}'",
            chosen.path,
            all.len(),
            archive_name
        ),
        _ => format!(
            "{} of {} candidates; depth {}, first in lexicographic order",
            chosen.path,
            all.len(),
            min_depth
        ),
    };

    Some(TieBreak {
        candidates: all,
        chosen: vec![chosen.path.clone()],
        rule,
        rationale,
    })
}

/// Builds the compilation plan and assigns preflight roles.
///
/// Manifest-declared entries win over inference. Roles set by the manifest
/// are left alone.
pub fn classify(
    sub: &mut Submission,
    directives: &Directives,
    report: &PreflightReport,
) -> Result<CompilationPlan, PreflightError> {
    for scan in &report.files {
        for issue in &scan.issues {
            sub.warn(SubmissionWarning::Preflight {
                name: scan.path.clone(),
                issue: issue.clone(),
            });
        }
    }

    let tie = if directives.has_entries() {
        TieBreak {
            candidates: directives.entries.clone(),
            chosen: directives.entries.clone(),
            rule: TieBreakRule::Manifest,
            rationale: "entries declared by the manifest".to_string(),
        }
    } else {
        tie_break(&report.candidates, &sub.archive_name).ok_or(
            PreflightError::NoEntryPointFound {
                scanned: report.files.len(),
            },
        )?
    };
    info!(chosen = ?tie.chosen, rule = ?tie.rule, "entry selected");

    let mut entries = Vec::new();
    for path in &tie.chosen {
        let inferred = report
            .candidates
            .iter()
            .find(|c| &c.path == path)
            .cloned()
            .unwrap_or_else(|| report.infer(path, sub));
        if inferred.images.conflicting() {
            sub.warn(SubmissionWarning::Preflight {
                name: path.clone(),
                issue: "conflicting_image_types: both PDF-only and DVI-only graphics used"
                    .to_string(),
            });
        }
        let engine = directives.engine.unwrap_or(inferred.engine);
        let stem = stem_of(path);
        let bbl = match dir_of(path) {
            "" => format!("{}.bbl", stem),
            dir => format!("{}/{}.bbl", dir, stem),
        };
        entries.push(PlanEntry {
            file: path.clone(),
            engine,
            attributes: sub.file(path).map(|f| f.attributes.clone()).unwrap_or_default(),
            pdfoutput_declared: report.scan(path).map(|s| s.pdfoutput).unwrap_or(false),
            prebuilt_bbl: sub.contains(&bbl),
        });
    }

    assign_roles(sub, report, &tie.chosen);

    let engine = entries
        .first()
        .map(|e| e.engine)
        .unwrap_or_default();
    Ok(CompilationPlan {
        engine,
        entries,
        font_maps: directives.font_maps.clone(),
        postprocess: directives.postprocess.clone(),
        tie_break: Some(tie),
        search_dirs: report.search_dirs.clone(),
    })
}

fn assign_roles(sub: &mut Submission, report: &PreflightReport, chosen: &[String]) {
    let referenced: BTreeSet<String> = report.referenced().into_iter().map(str::to_string).collect();
    let paths: Vec<String> = sub
        .files
        .values()
        .filter(|f| f.role_source == RoleSource::Default)
        .map(|f| f.path.clone())
        .collect();
    for path in paths {
        let ext = extension_of(&path);
        let role = if chosen.contains(&path) {
            FileRole::Entry
        } else if ext == "bib" {
            FileRole::Bibliography
        } else if referenced.contains(&path) {
            FileRole::Included
        } else if TEXT_EXTENSIONS.contains(&ext.as_str())
            || SUPPORT_EXTENSIONS.contains(&ext.as_str())
        {
            continue;
        } else {
            FileRole::Appended
        };
        sub.set_role(&path, role, RoleSource::Preflight);
    }
}
