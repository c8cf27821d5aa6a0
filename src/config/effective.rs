//! Effective configuration with full provenance
//!
//! The effective configuration captures the merged configuration plus
//! information about where each value came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::defaults::LaneConfig;
use super::merge::merge_layers;

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "tex-lane/effective_config@1";

/// Host configuration location, relative to `$HOME`.
pub const HOST_CONFIG_PATH: &str = ".config/tex-lane/config.toml";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Submission,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Effective configuration with full provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_version: u32,
    pub schema_id: String,

    /// When this config was computed
    pub created_at: DateTime<Utc>,

    /// The merged configuration object
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    /// Typed view of `config`
    #[serde(skip)]
    pub lane: LaneConfig,
}

/// `~/.config/tex-lane/config.toml`, when `$HOME` is set.
pub fn default_host_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(HOST_CONFIG_PATH))
}

impl EffectiveConfig {
    /// Build effective config from layers
    pub fn build(
        host_config_path: Option<&Path>,
        submission_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![LaneConfig::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        // A missing host file is normal; a missing explicit file is not.
        if let Some(path) = host_config_path {
            if path.exists() {
                let (value, digest) = load_toml_file(path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::Host,
                    path: Some(path.to_string_lossy().to_string()),
                    digest: Some(digest),
                });
            }
        }

        if let Some(path) = submission_config_path {
            let (value, digest) = load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Submission,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let lane: LaneConfig = serde_json::from_value(merged.clone())
            .map_err(|e| ConfigError::ParseError(format!("invalid configuration: {}", e)))?;
        lane.validate()?;

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config: merged,
            sources,
            lane,
        })
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write to file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("JSON serialization failed: {}", e),
            )
        })?;
        fs::write(path, json)
    }

    /// Get a config value by path (dot-separated)
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(|v| v.as_u64())
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(|v| v.as_bool())
    }
}

/// Load and parse a TOML file, returning the value and digest
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hex::encode(hasher.finalize());

    let contents = String::from_utf8(bytes)
        .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;
    let toml_value: toml::Value = toml::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

    Ok((toml_to_json(toml_value), digest))
}

/// Convert TOML Value to JSON Value
fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::build(None, None, None).unwrap();

        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert_eq!(config.get_u64("max_passes"), Some(5));
        assert_eq!(config.get_str("sandbox.isolation"), Some("bwrap"));
        assert_eq!(config.lane, LaneConfig::default());
    }

    #[test]
    fn test_build_with_cli_override() {
        let cli = serde_json::json!({
            "max_passes": 3,
            "timeouts": {"overall_seconds": 120, "invocation_seconds": 60}
        });
        let config = EffectiveConfig::build(None, None, Some(cli)).unwrap();

        assert_eq!(config.lane.max_passes, 3);
        assert_eq!(config.lane.timeouts.overall_seconds, 120);
        // Untouched keys of the same section survive the merge
        assert_eq!(config.lane.timeouts.termination_grace_seconds, 5);
    }

    #[test]
    fn test_validation_rejects_bad_timeouts() {
        let cli = serde_json::json!({"timeouts": {"overall_seconds": 0}});
        let err = EffectiveConfig::build(None, None, Some(cli)).unwrap_err();
        assert!(err.to_string().contains("overall_seconds"));
    }

    #[test]
    fn test_unknown_shape_is_parse_error() {
        let cli = serde_json::json!({"max_passes": "many"});
        assert!(matches!(
            EffectiveConfig::build(None, None, Some(cli)),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_layer_precedence_and_provenance() {
        let mut host = NamedTempFile::new().unwrap();
        writeln!(host, "max_passes = 4").unwrap();
        writeln!(host, "[engines]").unwrap();
        writeln!(host, "pdflatex = \"/opt/tl/bin/pdflatex\"").unwrap();

        let mut submission = NamedTempFile::new().unwrap();
        writeln!(submission, "max_passes = 2").unwrap();
        writeln!(submission, "[resolver]").unwrap();
        writeln!(submission, "search_dirs = [\"figs\"]").unwrap();

        let cli = serde_json::json!({"jobs": 1});
        let config =
            EffectiveConfig::build(Some(host.path()), Some(submission.path()), Some(cli)).unwrap();

        assert_eq!(config.lane.max_passes, 2);
        assert_eq!(config.lane.engines.pdflatex, "/opt/tl/bin/pdflatex");
        assert_eq!(config.lane.engines.bibtex, "bibtex");
        assert_eq!(config.lane.resolver.search_dirs, vec!["figs".to_string()]);
        assert_eq!(config.lane.jobs, 1);

        let origins: Vec<_> = config.sources.iter().map(|s| s.origin.clone()).collect();
        assert_eq!(
            origins,
            vec![
                ConfigOrigin::Builtin,
                ConfigOrigin::Host,
                ConfigOrigin::Submission,
                ConfigOrigin::Cli
            ]
        );
        assert_eq!(config.sources[1].digest.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn test_missing_host_file_is_skipped() {
        let config =
            EffectiveConfig::build(Some(Path::new("/nonexistent/tex-lane.toml")), None, None).unwrap();
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_missing_submission_file_is_an_error() {
        let result = EffectiveConfig::build(None, Some(Path::new("/nonexistent/tex-lane.toml")), None);
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = EffectiveConfig::build(None, None, None).unwrap();
        let json = config.to_json().unwrap();
        assert!(json.contains("tex-lane/effective_config@1"));
        assert!(!json.contains("\"lane\""));
    }
}
