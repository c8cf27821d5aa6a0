//! Submission model
//!
//! Typed view of an extracted source tree: one [`SourceFile`] per regular
//! file, each carrying a closed [`FileRole`] and per-file attributes set by
//! the manifest or by preflight inference.

mod plan;

pub use plan::{
    CompilationPlan, Engine, PlanEntry, PostProcess, TieBreak, TieBreakRule, UnsupportedEngine,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Directories never treated as part of the submission.
const SKIPPED_DIRS: &[&str] = &[".git", ".svn", ".hg", "__MACOSX"];

/// Role of a file in the compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    /// Top-level compilation target
    Entry,
    /// Pulled in by an entry file
    Included,
    /// Excluded from compilation and output
    Ignored,
    /// Delivered alongside the output without compilation
    Appended,
    /// Bibliography database
    Bibliography,
    /// Not yet classified
    Unknown,
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileRole::Entry => "entry",
            FileRole::Included => "included",
            FileRole::Ignored => "ignored",
            FileRole::Appended => "appended",
            FileRole::Bibliography => "bibliography",
            FileRole::Unknown => "unknown",
        }
    }
}

/// Who assigned a file's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleSource {
    Manifest,
    Preflight,
    Resolver,
    Default,
}

/// Per-file compilation attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    #[serde(default)]
    pub landscape: bool,

    #[serde(default)]
    pub keep_comments: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub font_maps: Vec<String>,
}

/// Non-fatal findings attached to the submission or one of its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionWarning {
    /// More than one manifest at the root; all of them were ignored
    ManifestConflict { files: Vec<String> },
    /// The manifest could not be read or parsed
    ManifestUnreadable { file: String, reason: String },
    /// The manifest names a compiler outside the supported set
    UnsupportedEngine { value: String },
    /// The manifest names a file that is not in the tree
    DanglingSourceReference { name: String },
    /// The manifest gives a file mutually exclusive roles
    ConflictingRoles { name: String },
    /// A manifest attribute has a value of the wrong shape
    InvalidAttribute {
        name: String,
        key: String,
        value: String,
    },
    /// The file is executable and was excluded
    ExecutableFile { name: String },
    /// A symbolic link was skipped
    SymlinkSkipped { name: String },
    /// Preflight found something suspicious in a file
    Preflight { name: String, issue: String },
    /// An output named for assembling was not produced
    AssemblingFileNotFound { name: String },
}

/// One file of the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the submission root, `/`-separated
    pub path: String,
    pub role: FileRole,
    pub role_source: RoleSource,
    pub attributes: FileAttributes,
    pub size: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub executable: bool,
}

impl SourceFile {
    fn new(path: String, size: u64, executable: bool) -> Self {
        Self {
            path,
            role: FileRole::Unknown,
            role_source: RoleSource::Default,
            attributes: FileAttributes::default(),
            size,
            executable,
        }
    }

    /// Lowercased extension, with `.gz`/`.Z` compound extensions kept whole.
    pub fn extension(&self) -> String {
        extension_of(&self.path)
    }
}

/// Lowercased extension of a relative path; compressed PostScript keeps both parts.
pub fn extension_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    for compound in ["eps.gz", "ps.gz", "eps.z", "ps.z"] {
        if name.ends_with(&format!(".{}", compound)) {
            return compound.to_string();
        }
    }
    match name.rfind('.') {
        Some(i) if i > 0 => name[i + 1..].to_string(),
        _ => String::new(),
    }
}

/// File name without directory and extension.
pub fn stem_of(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(i) if i > 0 => &name[..i],
        _ => name,
    }
}

/// Normalizes a reference to a root-relative path.
///
/// Strips `./`, collapses `..` against earlier components, and returns
/// `None` when the path is absolute or climbs above the root.
pub fn normalize_rel(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// An extracted submission tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Absolute path of the extracted tree
    pub root: PathBuf,

    /// Base name of the original archive, used for entry tie-breaking and output naming
    pub archive_name: String,

    /// Files keyed by relative path
    pub files: BTreeMap<String, SourceFile>,

    /// Submission-wide findings, in discovery order
    pub warnings: Vec<SubmissionWarning>,
}

impl Submission {
    /// A submission with no files, for recording a tree that could not be read.
    pub fn empty(root: &Path, archive_name: Option<&str>) -> Self {
        Self {
            root: root.to_path_buf(),
            archive_name: submission_name(root, archive_name),
            files: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Walks `root` and records every regular file as `Unknown`.
    ///
    /// Symbolic links are not followed and are reported; manifests and VCS
    /// directories are left out.
    pub fn scan(root: &Path, archive_name: Option<&str>) -> io::Result<Self> {
        let root = root.canonicalize()?;
        let archive_name = submission_name(&root, archive_name);

        let mut files = BTreeMap::new();
        let mut warnings = Vec::new();

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && SKIPPED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
            });

        for entry in walker {
            let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            let Ok(rel) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let Some(rel) = rel.to_str().map(|s| s.replace('\\', "/")) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            if entry.file_type().is_symlink() {
                warnings.push(SubmissionWarning::SymlinkSkipped { name: rel });
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if !rel.contains('/') && crate::manifest::is_manifest_name(&rel) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            let executable = is_executable(&metadata, entry.path());
            files.insert(rel.clone(), SourceFile::new(rel, metadata.len(), executable));
        }

        Ok(Self {
            root,
            archive_name,
            files,
            warnings,
        })
    }

    pub fn file(&self, path: &str) -> Option<&SourceFile> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Absolute path of a tree file.
    pub fn abs(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Sets a file's role, returning false when the file does not exist.
    pub fn set_role(&mut self, path: &str, role: FileRole, source: RoleSource) -> bool {
        match self.files.get_mut(path) {
            Some(file) => {
                file.role = role;
                file.role_source = source;
                true
            }
            None => false,
        }
    }

    pub fn set_attributes(&mut self, path: &str, attributes: FileAttributes) -> bool {
        match self.files.get_mut(path) {
            Some(file) => {
                file.attributes = attributes;
                true
            }
            None => false,
        }
    }

    /// Files with the given role, in path order.
    pub fn files_with_role(&self, role: FileRole) -> impl Iterator<Item = &SourceFile> {
        self.files.values().filter(move |f| f.role == role)
    }

    /// Paths of entry files, in path order.
    pub fn entries(&self) -> Vec<String> {
        self.files_with_role(FileRole::Entry)
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn warn(&mut self, warning: SubmissionWarning) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    /// Finds a tree file for a reference.
    ///
    /// `base_dir` is the directory the engine runs in, relative to the root.
    /// Tries `base_dir` and then each search directory under it, and within
    /// each the name as written followed by the name with each candidate
    /// extension.
    pub fn lookup(
        &self,
        name: &str,
        extensions: &[String],
        base_dir: &str,
        search_dirs: &[String],
    ) -> Option<String> {
        let dirs = std::iter::once("").chain(search_dirs.iter().map(String::as_str));
        for dir in dirs {
            let joined = [base_dir, dir.trim_end_matches('/'), name]
                .iter()
                .filter(|part| !part.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join("/");
            let Some(base) = normalize_rel(&joined) else {
                continue;
            };
            if self.files.contains_key(&base) {
                return Some(base);
            }
            for ext in extensions {
                let candidate = format!("{}.{}", base, ext.trim_start_matches('.'));
                if self.files.contains_key(&candidate) {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// Strips archive extensions from a file name.
fn submission_name(root: &Path, archive_name: Option<&str>) -> String {
    archive_name
        .map(|n| archive_base_name(n).to_string())
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "submission".to_string())
}

pub fn archive_base_name(name: &str) -> &str {
    let name = name.rsplit('/').next().unwrap_or(name);
    for suffix in [".tar.gz", ".tgz", ".tar.bz2", ".tar", ".zip", ".gz"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped;
            }
        }
    }
    name
}

const BINARY_MAGIC: &[&[u8]] = &[
    b"\x7fELF",
    b"MZ",
    b"\xfe\xed\xfa\xce",
    b"\xfe\xed\xfa\xcf",
    b"\xcf\xfa\xed\xfe",
    b"\xce\xfa\xed\xfe",
    b"\xca\xfe\xba\xbe",
];

fn is_executable(metadata: &std::fs::Metadata, path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 != 0 {
            return true;
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    let mut head = [0u8; 4];
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    use std::io::Read;
    let Ok(n) = file.read(&mut head) else {
        return false;
    };
    BINARY_MAGIC.iter().any(|magic| head[..n].starts_with(magic))
}
