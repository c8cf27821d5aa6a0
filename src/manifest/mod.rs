//! Directive parser
//!
//! Finds the optional `00README` manifest at the submission root, decodes it
//! by suffix (JSON, YAML or TOML), and applies its directives to the
//! [`Submission`]. Nothing in here is fatal: every problem becomes a
//! [`SubmissionWarning`] and classification falls back to inference.

mod schema;

pub use schema::{parse_bool, Manifest, RoleConflict, SchemaIssue, SourceDirective, Usage};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::submission::{
    Engine, FileRole, PostProcess, RoleSource, Submission, SubmissionWarning,
};

/// Stem shared by all manifest spellings.
pub const MANIFEST_STEM: &str = "00readme";

/// Decoder chosen from the manifest suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    Json,
    Yaml,
    Toml,
}

impl ManifestFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" | "jsn" => Some(ManifestFormat::Json),
            "yaml" | "yml" => Some(ManifestFormat::Yaml),
            "toml" => Some(ManifestFormat::Toml),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("multiple manifests at submission root: {}", .0.join(", "))]
    Conflict(Vec<String>),

    #[error("unrecognized manifest suffix: {0}")]
    UnknownFormat(String),

    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {message}")]
    Parse { path: String, message: String },
}

/// Whether a root-level file name is a manifest.
pub fn is_manifest_name(name: &str) -> bool {
    let path = Path::new(name);
    let stem_matches = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case(MANIFEST_STEM))
        .unwrap_or(false);
    stem_matches && ManifestFormat::from_path(path).is_some()
}

/// Finds the manifest at `root`.
///
/// Returns `Ok(None)` when there is none and [`ManifestError::Conflict`]
/// when there is more than one.
pub fn discover(root: &Path) -> Result<Option<PathBuf>, ManifestError> {
    let read = std::fs::read_dir(root).map_err(|source| ManifestError::Io {
        path: root.display().to_string(),
        source,
    })?;
    let mut found: Vec<String> = read
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| is_manifest_name(name))
        .collect();
    found.sort();
    match found.len() {
        0 => Ok(None),
        1 => Ok(Some(root.join(&found[0]))),
        _ => Err(ManifestError::Conflict(found)),
    }
}

/// Decodes manifest text into a format-neutral value.
pub fn decode(text: &str, format: ManifestFormat) -> Result<serde_json::Value, String> {
    match format {
        ManifestFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
        ManifestFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        ManifestFormat::Toml => {
            let value: toml::Value = toml::from_str(text).map_err(|e| e.to_string())?;
            serde_json::to_value(value).map_err(|e| e.to_string())
        }
    }
}

/// Reads and interprets a manifest file.
pub fn load(path: &Path) -> Result<Manifest, ManifestError> {
    let display = path.display().to_string();
    let format =
        ManifestFormat::from_path(path).ok_or_else(|| ManifestError::UnknownFormat(display.clone()))?;
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: display.clone(),
        source,
    })?;
    let doc = decode(&text, format).map_err(|message| ManifestError::Parse {
        path: display,
        message,
    })?;
    Ok(Manifest::from_value(&doc))
}

/// What the manifest contributed after validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directives {
    /// File name of the manifest that was applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_file: Option<String>,

    /// Engine named by the manifest, when it is supported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<Engine>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub font_maps: Vec<String>,

    #[serde(default)]
    pub postprocess: PostProcess,

    /// Entries named by the manifest, in manifest order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<String>,
}

impl Directives {
    pub fn has_entries(&self) -> bool {
        !self.entries.is_empty()
    }
}

/// Applies a manifest to the submission, recording every problem as a warning.
pub fn apply(manifest: &Manifest, submission: &mut Submission) -> Directives {
    let mut directives = Directives {
        font_maps: manifest.font_maps.clone(),
        postprocess: manifest.postprocess.clone(),
        ..Default::default()
    };

    for issue in &manifest.issues {
        submission.warn(SubmissionWarning::InvalidAttribute {
            name: issue.name.clone(),
            key: issue.key.clone(),
            value: issue.value.clone(),
        });
    }

    if let Some(compiler) = &manifest.compiler {
        match Engine::from_compiler(compiler) {
            Ok(engine) => directives.engine = Some(engine),
            Err(e) => {
                warn!(compiler = %compiler, "manifest names unsupported engine");
                submission.warn(SubmissionWarning::UnsupportedEngine { value: e.0 });
            }
        }
    }

    for source in &manifest.sources {
        let Some(name) = crate::submission::normalize_rel(&source.name) else {
            submission.warn(SubmissionWarning::DanglingSourceReference {
                name: source.name.clone(),
            });
            continue;
        };
        if !submission.contains(&name) {
            debug!(name = %name, "manifest source not in tree");
            submission.warn(SubmissionWarning::DanglingSourceReference { name });
            continue;
        }
        let role = match source.role() {
            Ok(role) => role,
            Err(RoleConflict::Exclusive) => {
                submission.warn(SubmissionWarning::ConflictingRoles { name });
                continue;
            }
        };
        submission.set_role(&name, role, RoleSource::Manifest);
        submission.set_attributes(&name, source.attributes());
        if role == FileRole::Entry && !directives.entries.contains(&name) {
            directives.entries.push(name);
        }
    }

    directives
}

/// Discovers, loads and applies the manifest for a submission.
///
/// `override_path` replaces root discovery. Any failure leaves the
/// submission untouched apart from a warning.
pub fn read_directives(submission: &mut Submission, override_path: Option<&Path>) -> Directives {
    let path = match override_path {
        Some(path) => path.to_path_buf(),
        None => match discover(&submission.root) {
            Ok(Some(path)) => path,
            Ok(None) => return Directives::default(),
            Err(ManifestError::Conflict(files)) => {
                warn!(files = ?files, "multiple manifests, ignoring all of them");
                submission.warn(SubmissionWarning::ManifestConflict { files });
                return Directives::default();
            }
            Err(e) => {
                submission.warn(SubmissionWarning::ManifestUnreadable {
                    file: submission.root.display().to_string(),
                    reason: e.to_string(),
                });
                return Directives::default();
            }
        },
    };

    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match load(&path) {
        Ok(manifest) => {
            let mut directives = apply(&manifest, submission);
            directives.manifest_file = Some(file);
            directives
        }
        Err(e) => {
            warn!(file = %file, error = %e, "manifest unreadable");
            submission.warn(SubmissionWarning::ManifestUnreadable {
                file,
                reason: e.to_string(),
            });
            Directives::default()
        }
    }
}
