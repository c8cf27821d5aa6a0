//! The `Run` record: one external invocation, immutable once returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::ProfileKind;

/// Exit code recorded when the sandbox could not be set up.
pub const SETUP_FAILED_EXIT: i32 = 125;

/// Exit code recorded when the invocation hit its wall-clock limit.
pub const TIMEOUT_EXIT: i32 = 124;

/// Exit code recorded when the invocation was cancelled.
pub const CANCELLED_EXIT: i32 = 130;

/// Which part of the pipeline an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Batched dependency-resolution query
    Resolve,
    /// Engine pass
    Engine,
    /// Bibliography or index processor between passes
    Auxiliary,
    /// DVI/PS to PDF conversion
    Convert,
    /// Combine or stamp outputs
    PostProcess,
}

/// Placement of a run within the orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTag {
    pub stage: Stage,

    /// Entry file the run belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,

    /// Pass number the run belongs to (1-based)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<u32>,
}

impl RunTag {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            entry: None,
            pass: None,
        }
    }

    pub fn entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn pass(mut self, pass: u32) -> Self {
        self.pass = Some(pass);
        self
    }
}

/// How the invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Completion {
    /// The process exited on its own
    Exited,
    /// The process was terminated after its wall-clock limit
    TimedOut,
    /// The process was terminated by a cancellation request
    Cancelled,
    /// The process never started
    SetupFailed,
}

/// Marker for runs synthesised from a setup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMarker {
    SandboxSetupFailed,
    UnknownBinaryLocation,
}

/// One external invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Execution order across the whole submission
    pub seq: u64,

    pub tag: RunTag,

    /// Binary as requested
    pub program: String,

    /// Resolved binary path, when resolution succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,

    /// Argument vector passed to the binary (without the sandbox wrapper)
    pub args: Vec<String>,

    /// Working directory
    pub cwd: String,

    /// Allow-list profile the binary was run under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileKind>,

    /// Environment keys passed to the process (values are not recorded)
    pub env_keys: Vec<String>,

    pub stdout: String,
    pub stderr: String,

    /// Process exit code, or a synthetic code for timeouts, cancellation and setup failures
    pub exit_code: i32,

    /// Signal that terminated the process, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term_signal: Option<String>,

    pub completion: Completion,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<RunMarker>,

    /// Human-readable setup failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,

    /// Tool log written by this invocation, relative to the work directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Run {
    /// True when the process ran to completion and exited zero.
    pub fn succeeded(&self) -> bool {
        self.completion == Completion::Exited && self.exit_code == 0
    }

    /// True when the process never started.
    pub fn is_setup_failure(&self) -> bool {
        self.completion == Completion::SetupFailed
    }

    /// Combined stdout and stderr, for log scanning when no tool log exists.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
