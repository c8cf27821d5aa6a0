//! Built-in defaults (layer 1) and the typed view of the merged configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use tex_lane_logscan::{SignatureSpec, SignatureTable, DEFAULT_EXCERPT_LINES};
use tex_lane_sandbox::{
    EnvFilter, Isolation, ProfileSet, ResourceLimits, SandboxConfig, SandboxProfile, NOBODY,
};

use super::ConfigError;
use crate::orchestrator::{OrchestratorSettings, PostProcessCommands, ToolBinaries};
use crate::resolver::ResolverOptions;
use crate::timeout::TimeoutConfig;

/// Upper bound accepted for `max_passes`.
pub const MAX_PASSES_LIMIT: u32 = 20;

/// Files of the output directory that go into the outcome bundle.
pub const DEFAULT_BUNDLE_INCLUDE: &[&str] = &["*.pdf", "logs/*.log"];

/// Inspection helper used when the configuration does not name one.
pub const DEFAULT_RESOLVER_HELPER: &[&str] = &[
    "texlua",
    "/usr/local/share/tex-lane/kpse_search.lua",
    "-mark-sys-files",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Wrap every invocation in bubblewrap
    Bwrap,
    /// Run directly (tests and trusted hosts)
    None,
}

/// `[sandbox]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub isolation: IsolationMode,
    pub bwrap_path: PathBuf,

    /// Installation roots of TeX distribution binaries
    pub toolchain_prefixes: Vec<PathBuf>,

    /// Installation roots of general utilities
    pub postprocess_prefixes: Vec<PathBuf>,

    /// Read-only paths granted to every invocation
    pub extra_read_only: Vec<PathBuf>,

    pub uid: u32,
    pub gid: u32,
    pub limits: ResourceLimits,

    /// Per-stream capture limit
    pub max_output_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let profiles = ProfileSet::default();
        Self {
            isolation: IsolationMode::Bwrap,
            bwrap_path: PathBuf::from("bwrap"),
            toolchain_prefixes: profiles.toolchain.prefixes.clone(),
            postprocess_prefixes: profiles.postprocess.prefixes.clone(),
            extra_read_only: Vec::new(),
            uid: NOBODY,
            gid: NOBODY,
            limits: ResourceLimits::default(),
            max_output_bytes: 1 << 20,
        }
    }
}

/// `[resolver]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Helper argv; the search root is appended as the last argument
    pub helper: Vec<String>,

    /// Extra in-tree directories searched for references
    pub search_dirs: Vec<String>,

    /// Query the toolchain database for names not found in the tree
    pub system_db: bool,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            helper: DEFAULT_RESOLVER_HELPER.iter().map(|s| s.to_string()).collect(),
            search_dirs: Vec::new(),
            system_db: true,
        }
    }
}

/// `[outcome]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeSettings {
    /// Cap on unused pictures listed in the dependency report
    pub max_appending_files: usize,

    /// Log lines kept in unclassified error excerpts
    pub excerpt_lines: usize,

    /// Write the `<base>.outcome.tar.gz` bundle
    pub bundle: bool,

    /// Globs, relative to the output directory, of files put in the bundle
    pub bundle_include: Vec<String>,

    /// Extra error signatures, checked before the built-in ones
    pub signatures: Vec<SignatureSpec>,
}

impl Default for OutcomeSettings {
    fn default() -> Self {
        Self {
            max_appending_files: 20,
            excerpt_lines: DEFAULT_EXCERPT_LINES,
            bundle: true,
            bundle_include: DEFAULT_BUNDLE_INCLUDE.iter().map(|s| s.to_string()).collect(),
            signatures: Vec::new(),
        }
    }
}

/// `[fixups]` section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixupSettings {
    pub enabled: bool,
}

/// Full configuration. `LaneConfig::default()` is the built-in layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub max_passes: u32,
    pub jobs: usize,
    pub timeouts: TimeoutConfig,
    pub sandbox: SandboxSettings,
    pub resolver: ResolverSettings,
    pub engines: ToolBinaries,
    pub postprocess: PostProcessCommands,
    pub outcome: OutcomeSettings,
    pub fixups: FixupSettings,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_passes: 5,
            jobs: 4,
            timeouts: TimeoutConfig::default(),
            sandbox: SandboxSettings::default(),
            resolver: ResolverSettings::default(),
            engines: ToolBinaries::default(),
            postprocess: PostProcessCommands::default(),
            outcome: OutcomeSettings::default(),
            fixups: FixupSettings::default(),
        }
    }
}

impl LaneConfig {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.max_passes == 0 || self.max_passes > MAX_PASSES_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "max_passes must be in [1, {}], got {}",
                MAX_PASSES_LIMIT, self.max_passes
            )));
        }

        if self.jobs == 0 {
            return Err(ConfigError::ValidationError(
                "jobs must be at least 1".to_string(),
            ));
        }

        let engines = &self.engines;
        for (key, value) in [
            ("engines.tex", &engines.tex),
            ("engines.latex", &engines.latex),
            ("engines.pdflatex", &engines.pdflatex),
            ("engines.dvips", &engines.dvips),
            ("engines.ps2pdf", &engines.ps2pdf),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{} must not be empty", key)));
            }
        }

        if self.resolver.system_db && self.resolver.helper.is_empty() {
            return Err(ConfigError::ValidationError(
                "resolver.helper must not be empty when resolver.system_db is set".to_string(),
            ));
        }

        self.signature_table()?;
        crate::outcome::bundle::include_set(&self.outcome.bundle_include)
            .map_err(|e| ConfigError::ValidationError(format!("outcome.bundle_include: {}", e)))?;

        Ok(())
    }

    /// Built-in error signatures preceded by the configured ones.
    pub fn signature_table(&self) -> Result<SignatureTable, ConfigError> {
        SignatureTable::builtin()
            .and_then(|table| table.with_overrides(&self.outcome.signatures))
            .map(|table| table.excerpt_lines(self.outcome.excerpt_lines))
            .map_err(|e| ConfigError::ValidationError(format!("outcome.signatures: {}", e)))
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        let settings = &self.sandbox;
        SandboxConfig {
            isolation: match settings.isolation {
                IsolationMode::Bwrap => Isolation::Bubblewrap {
                    bwrap: settings.bwrap_path.clone(),
                },
                IsolationMode::None => Isolation::None,
            },
            profiles: ProfileSet {
                toolchain: SandboxProfile::toolchain(settings.toolchain_prefixes.clone()),
                postprocess: SandboxProfile::postprocess(settings.postprocess_prefixes.clone()),
            },
            env_filter: EnvFilter::new(),
            limits: settings.limits,
            default_timeout: self.timeouts.invocation(),
            termination_grace: self.timeouts.grace(),
            uid: settings.uid,
            gid: settings.gid,
            max_output_bytes: settings.max_output_bytes,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_passes: self.max_passes,
            jobs: self.jobs,
            tools: self.engines.clone(),
            postprocess: self.postprocess.clone(),
            fixups: self.fixups.enabled,
            extra_read_only: self.sandbox.extra_read_only.clone(),
        }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            search_dirs: self.resolver.search_dirs.clone(),
            max_unused_pictures: self.outcome.max_appending_files,
        }
    }
}
