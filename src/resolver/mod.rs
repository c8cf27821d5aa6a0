//! Dependency resolver
//!
//! Walks each entry's include closure and resolves every reference in
//! layers: the submission tree first (literal path, then each in-tree search
//! directory), then the toolchain database for whatever is left, in one
//! batched query per engine. The result is a deterministic [`DependencyReport`].

mod db;
mod protocol;

pub use db::{BatchResult, KpseToolchainDb, StaticToolchainDb, ToolchainDb};
pub use protocol::{
    decode_response, encode_request, parse_found, Found, QueryAnswer, QueryBatch, QueryItem,
    SYSTEM_PREFIX,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use tex_lane_sandbox::Run;

use crate::preflight::{PreflightReport, RefKind};
use crate::submission::{
    extension_of, CompilationPlan, FileRole, RoleSource, Submission,
};

/// Extensions listed in the unused-pictures summary.
pub const PICTURE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "pdf", "eps"];

/// Commands whose target may legitimately be absent.
const OPTIONAL_COMMANDS: &[&str] = &["InputIfFileExists"];

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("resolver protocol error: {0}")]
    Protocol(String),

    #[error("resolver helper failed: {message}")]
    Helper { message: String, run: Box<Run> },
}

impl ResolveError {
    /// The helper run behind this error, if one was made.
    pub fn run(&self) -> Option<&Run> {
        match self {
            ResolveError::Helper { run, .. } => Some(run),
            ResolveError::Protocol(_) => None,
        }
    }
}

/// One reference with its resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedReference {
    /// File containing the reference
    pub from: String,
    pub name: String,
    pub kind: RefKind,
    pub command: String,
    pub found: Found,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// Used and unused files, and where every reference went.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub references: Vec<ResolvedReference>,
    pub used: BTreeSet<String>,
    pub unused: BTreeSet<String>,
    pub missing: Vec<ResolvedReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unused_pictures: Vec<String>,
    /// More unused pictures existed than were listed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unused_pictures_truncated: bool,
    /// Why the toolchain database could not be consulted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_error: Option<String>,
}

impl DependencyReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn is_missing(&self, name: &str) -> bool {
        self.missing.iter().any(|r| r.name == name)
    }
}

/// Report plus the helper run, which belongs in the outcome's run list.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub report: DependencyReport,
    pub runs: Vec<Run>,
}

/// Resolution settings.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// In-tree search directories added to those from `\graphicspath`
    pub search_dirs: Vec<String>,
    /// Cap on the unused-pictures listing
    pub max_unused_pictures: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            search_dirs: Vec::new(),
            max_unused_pictures: 20,
        }
    }
}

pub struct Resolver<'a> {
    db: &'a dyn ToolchainDb,
    options: ResolverOptions,
}

struct Pending {
    from: String,
    name: String,
    kind: RefKind,
    command: String,
    item: QueryItem,
    progname: &'static str,
}

impl<'a> Resolver<'a> {
    pub fn new(db: &'a dyn ToolchainDb, options: ResolverOptions) -> Self {
        Self { db, options }
    }

    /// Resolves every reference reachable from the plan's entries.
    pub fn resolve(
        &self,
        sub: &Submission,
        preflight: &PreflightReport,
        plan: &CompilationPlan,
    ) -> Resolution {
        let mut search_dirs = plan.search_dirs.clone();
        for dir in &self.options.search_dirs {
            if !search_dirs.contains(dir) {
                search_dirs.push(dir.clone());
            }
        }

        let mut references: BTreeSet<ResolvedReference> = BTreeSet::new();
        let mut used: BTreeSet<String> = BTreeSet::new();
        let mut pending: Vec<Pending> = Vec::new();

        for entry in &plan.entries {
            let dvi = entry.engine.produces_dvi();
            let base = entry.dir();
            let progname = entry.engine.default_binary();
            let mut visited: BTreeSet<PathBuf> = BTreeSet::new();
            let mut queue: VecDeque<String> = VecDeque::from([entry.file.clone()]);

            let bbl = match base {
                "" => format!("{}.bbl", entry.job_name()),
                dir => format!("{}/{}.bbl", dir, entry.job_name()),
            };
            if sub.contains(&bbl) {
                used.insert(bbl);
            }

            while let Some(path) = queue.pop_front() {
                let key = sub.abs(&path).canonicalize().unwrap_or_else(|_| sub.abs(&path));
                if !visited.insert(key) {
                    continue;
                }
                used.insert(path.clone());
                let Some(scan) = preflight.scan(&path) else {
                    continue;
                };
                let own_dir = path.rfind('/').map(|i| &path[..i]).unwrap_or("");
                for reference in &scan.references {
                    let extensions = reference.kind.extensions(dvi);
                    let local = sub
                        .lookup(&reference.name, &extensions, base, &search_dirs)
                        .or_else(|| {
                            (own_dir != base)
                                .then(|| sub.lookup(&reference.name, &extensions, own_dir, &search_dirs))
                                .flatten()
                        });
                    let optional = OPTIONAL_COMMANDS.contains(&reference.command.as_str());
                    match local {
                        Some(found) => {
                            if reference.kind.is_text() {
                                queue.push_back(found.clone());
                            } else {
                                used.insert(found.clone());
                            }
                            references.insert(ResolvedReference {
                                from: path.clone(),
                                name: reference.name.clone(),
                                kind: reference.kind,
                                command: reference.command.clone(),
                                found: Found::Local(found),
                                optional,
                            });
                        }
                        None => pending.push(Pending {
                            from: path.clone(),
                            name: reference.name.clone(),
                            kind: reference.kind,
                            command: reference.command.clone(),
                            item: QueryItem {
                                name: reference.name.clone(),
                                extensions,
                            },
                            progname,
                        }),
                    }
                }
            }
        }

        // One batch per engine, since search rules differ between prognames
        let mut batches: BTreeMap<&'static str, BTreeSet<QueryItem>> = BTreeMap::new();
        for p in &pending {
            batches.entry(p.progname).or_default().insert(p.item.clone());
        }

        let mut runs = Vec::new();
        let mut db_errors = Vec::new();
        let mut answers: BTreeMap<(&'static str, QueryItem), Found> = BTreeMap::new();
        for (progname, items) in batches {
            let batch = QueryBatch {
                progname: Some(progname.to_string()),
                path_prefix: Some(sub.root.display().to_string()),
                items: items.into_iter().collect(),
            };
            info!(progname, items = batch.items.len(), "querying toolchain database");
            match self.db.query(&batch) {
                Ok(result) => {
                    runs.extend(result.run);
                    answers.extend(
                        result
                            .answers
                            .into_iter()
                            .map(|a| ((progname, a.item), a.found)),
                    );
                }
                Err(e) => {
                    warn!(progname, error = %e, "toolchain database query failed");
                    db_errors.push(e.to_string());
                    if let ResolveError::Helper { run, .. } = e {
                        runs.push(*run);
                    }
                }
            }
        }
        let db_error = (!db_errors.is_empty()).then(|| db_errors.join("; "));

        for p in pending {
            let optional = OPTIONAL_COMMANDS.contains(&p.command.as_str());
            let key = (p.progname, p.item);
            let found = match answers.get(&key).cloned().unwrap_or(Found::NotFound) {
                Found::Local(path) => self.localize(sub, &path),
                other => other,
            };
            if let Found::Local(path) = &found {
                used.insert(path.clone());
            }
            references.insert(ResolvedReference {
                from: p.from,
                name: p.name,
                kind: p.kind,
                command: p.command,
                found,
                optional,
            });
        }

        let references: Vec<ResolvedReference> = references.into_iter().collect();
        let missing: Vec<ResolvedReference> = references
            .iter()
            .filter(|r| r.found == Found::NotFound && !r.optional)
            .cloned()
            .collect();
        let unused: BTreeSet<String> = sub
            .files
            .values()
            .filter(|f| f.role != FileRole::Ignored && !used.contains(&f.path))
            .map(|f| f.path.clone())
            .collect();

        let pictures: Vec<&String> = unused
            .iter()
            .filter(|p| PICTURE_EXTENSIONS.contains(&extension_of(p).as_str()))
            .collect();
        let cap = self.options.max_unused_pictures;
        let report = DependencyReport {
            unused_pictures: pictures.iter().take(cap).map(|p| p.to_string()).collect(),
            unused_pictures_truncated: pictures.len() > cap,
            references,
            used,
            unused,
            missing,
            db_error,
        };
        debug!(
            used = report.used.len(),
            unused = report.unused.len(),
            missing = report.missing.len(),
            "dependency resolution done"
        );
        Resolution { report, runs }
    }

    /// A helper answer without the system marker: local when it names a tree file.
    fn localize(&self, sub: &Submission, path: &str) -> Found {
        let root = sub.root.display().to_string();
        let relative = path
            .strip_prefix(&root)
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(path);
        match crate::submission::normalize_rel(relative) {
            Some(rel) if sub.contains(&rel) => Found::Local(rel),
            _ => Found::System(path.to_string()),
        }
    }
}

/// Feeds the report back into the submission's roles.
///
/// Used files that preflight left unknown or tentatively appended become
/// included; unused appended files are confirmed. Manifest roles are kept.
pub fn apply_report(sub: &mut Submission, report: &DependencyReport) {
    let updates: Vec<(String, FileRole)> = sub
        .files
        .values()
        .filter(|f| f.role_source != RoleSource::Manifest)
        .filter_map(|f| {
            let used = report.used.contains(&f.path);
            match (f.role, used) {
                (FileRole::Appended | FileRole::Unknown, true) => {
                    Some((f.path.clone(), FileRole::Included))
                }
                (FileRole::Appended, false) => Some((f.path.clone(), FileRole::Appended)),
                (
                    FileRole::Entry
                    | FileRole::Included
                    | FileRole::Ignored
                    | FileRole::Bibliography
                    | FileRole::Unknown,
                    _,
                ) => None,
            }
        })
        .collect();
    for (path, role) in updates {
        sub.set_role(&path, role, RoleSource::Resolver);
    }
}
