//! Sandboxed executor for TeX toolchain and post-processing binaries.
//!
//! Every external invocation goes through [`Sandbox::run`], which never fails:
//! setup problems (unresolvable binary, binary outside every known
//! installation root, wrapper missing, spawn error) come back as a [`Run`]
//! with a synthetic exit code and a [`RunMarker`], so callers always have a
//! complete record.
//!
//! Isolation is provided by bubblewrap. The allow-list profile is picked from
//! the resolved installation path of the binary: TeX distribution binaries
//! get the narrow [`ProfileKind::Toolchain`] profile, general utilities the
//! wider [`ProfileKind::PostProcess`] profile.

mod bwrap;
mod env;
mod limits;
mod profile;
mod run;
mod runner;

pub use bwrap::{wrap_args, WrapSpec, NOBODY};
pub use env::{EnvFilter, ENGINE_ENV};
pub use limits::ResourceLimits;
pub use profile::{ProfileKind, ProfileSet, SandboxProfile};
pub use run::{
    Completion, Run, RunMarker, RunTag, Stage, CANCELLED_EXIT, SETUP_FAILED_EXIT, TIMEOUT_EXIT,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use runner::{supervise, Supervision};

/// Setup failures. These never escape [`Sandbox::run`]; they become runs.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("binary {binary} is not under any sandbox profile prefix")]
    UnknownBinaryLocation { binary: String },

    #[error("binary {binary} not found: {reason}")]
    BinaryNotFound { binary: String, reason: String },

    #[error("sandbox wrapper {0} not found")]
    WrapperNotFound(String),

    #[error("working directory {0} does not exist")]
    MissingWorkDir(String),

    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Marker recorded on the synthetic run.
    pub fn marker(&self) -> RunMarker {
        match self {
            SandboxError::UnknownBinaryLocation { .. } => RunMarker::UnknownBinaryLocation,
            _ => RunMarker::SandboxSetupFailed,
        }
    }
}

/// How processes are isolated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Isolation {
    /// Run under bubblewrap
    Bubblewrap { bwrap: PathBuf },
    /// Run directly, with only environment filtering, resource limits and profile selection
    None,
}

impl Default for Isolation {
    fn default() -> Self {
        Isolation::Bubblewrap {
            bwrap: PathBuf::from("bwrap"),
        }
    }
}

/// Sandbox configuration shared by all invocations.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub isolation: Isolation,
    pub profiles: ProfileSet,
    pub env_filter: EnvFilter,
    pub limits: ResourceLimits,

    /// Wall-clock limit for invocations that do not set their own
    pub default_timeout: Duration,

    /// Time between SIGTERM and SIGKILL
    pub termination_grace: Duration,

    /// Identity inside the sandbox
    pub uid: u32,
    pub gid: u32,

    /// Per-stream capture limit
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            profiles: ProfileSet::default(),
            env_filter: EnvFilter::new(),
            limits: ResourceLimits::default(),
            default_timeout: Duration::from_secs(300),
            termination_grace: Duration::from_secs(5),
            uid: NOBODY,
            gid: NOBODY,
            max_output_bytes: 1 << 20,
        }
    }
}

/// One requested invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tag: RunTag,

    /// Binary name (looked up on the invocation's `PATH`) or absolute path
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,

    /// Extra read-only paths
    pub allow_read: Vec<PathBuf>,

    /// Read-write paths; the working directory is usually one of them
    pub allow_write: Vec<PathBuf>,

    /// Variables set explicitly, bypassing the host filter
    pub env: Vec<(String, String)>,

    pub timeout: Option<Duration>,
    pub network: bool,
    pub stdin: Option<Vec<u8>>,

    /// Tool log this invocation is expected to write, relative to `cwd`
    pub log_path: Option<String>,
}

impl Invocation {
    pub fn new(tag: RunTag, program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        Self {
            tag,
            program: program.into(),
            args: Vec::new(),
            allow_read: Vec::new(),
            allow_write: vec![cwd.clone()],
            cwd,
            env: Vec::new(),
            timeout: None,
            network: false,
            stdin: None,
            log_path: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn allow_read(mut self, path: impl Into<PathBuf>) -> Self {
        self.allow_read.push(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

/// Everything resolved before spawning.
struct Prepared {
    binary: PathBuf,
    profile: ProfileKind,
    command: Command,
    env_keys: Vec<String>,
}

/// The sandboxed executor. Shareable across threads.
#[derive(Debug)]
pub struct Sandbox {
    config: SandboxConfig,
    cancel: Arc<AtomicBool>,
    seq: AtomicU64,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Flag shared with signal handlers and budget watchers.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Terminates in-flight invocations and makes new ones return cancelled runs.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Runs one invocation. Always returns a run.
    pub fn run(&self, invocation: &Invocation) -> Run {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let started_at = Utc::now();
        let start = Instant::now();

        if self.is_cancelled() {
            return self.synthetic(seq, invocation, started_at, start, None, Completion::Cancelled);
        }

        let mut prepared = match self.prepare(invocation) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(program = %invocation.program, error = %err, "sandbox setup failed");
                return self.synthetic(
                    seq,
                    invocation,
                    started_at,
                    start,
                    Some(err),
                    Completion::SetupFailed,
                );
            }
        };

        debug!(
            seq,
            binary = %prepared.binary.display(),
            profile = ?prepared.profile,
            args = ?invocation.args,
            "running"
        );

        let limits = Supervision {
            timeout: invocation.timeout.unwrap_or(self.config.default_timeout),
            grace: self.config.termination_grace,
            cancel: &self.cancel,
            max_output_bytes: self.config.max_output_bytes,
        };
        let finished = match supervise(&mut prepared.command, invocation.stdin.as_deref(), limits) {
            Ok(finished) => finished,
            Err(source) => {
                let err = SandboxError::Spawn {
                    binary: prepared.binary.display().to_string(),
                    source,
                };
                warn!(error = %err, "spawn failed");
                let mut run = self.synthetic(
                    seq,
                    invocation,
                    started_at,
                    start,
                    Some(err),
                    Completion::SetupFailed,
                );
                run.binary = Some(prepared.binary.display().to_string());
                run.profile = Some(prepared.profile);
                return run;
            }
        };

        let exit_code = match (finished.completion, finished.exit_code) {
            (Completion::TimedOut, _) => TIMEOUT_EXIT,
            (Completion::Cancelled, _) => CANCELLED_EXIT,
            (_, Some(code)) => code,
            // Killed by a signal it did not ask for; follow the shell convention.
            (_, None) => 128 + signal_number(finished.term_signal.as_deref()),
        };

        Run {
            seq,
            tag: invocation.tag.clone(),
            program: invocation.program.clone(),
            binary: Some(prepared.binary.display().to_string()),
            args: invocation.args.clone(),
            cwd: invocation.cwd.display().to_string(),
            profile: Some(prepared.profile),
            env_keys: prepared.env_keys,
            stdout: finished.stdout,
            stderr: finished.stderr,
            exit_code,
            term_signal: finished.term_signal,
            completion: finished.completion,
            marker: None,
            setup_error: None,
            log_path: invocation.log_path.clone(),
            started_at,
            ended_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Resolves the binary and picks the allow-list profile, without running anything.
    pub fn locate(
        &self,
        program: &str,
        search_path: Option<&str>,
        cwd: &Path,
    ) -> Result<(PathBuf, &SandboxProfile), SandboxError> {
        let resolved = match search_path {
            Some(path) => which::which_in(program, Some(path), cwd),
            None => which::which(program),
        }
        .map_err(|e| SandboxError::BinaryNotFound {
            binary: program.to_string(),
            reason: e.to_string(),
        })?;

        let mut candidates = vec![resolved.clone()];
        if let Ok(canonical) = resolved.canonicalize() {
            if canonical != resolved {
                candidates.push(canonical);
            }
        }
        let profile = self.config.profiles.select(&candidates)?;
        Ok((resolved, profile))
    }

    fn prepare(&self, invocation: &Invocation) -> Result<Prepared, SandboxError> {
        if !invocation.cwd.is_dir() {
            return Err(SandboxError::MissingWorkDir(
                invocation.cwd.display().to_string(),
            ));
        }

        let env = self
            .config
            .env_filter
            .build(std::env::vars(), &invocation.env);
        let (binary, profile) =
            self.locate(&invocation.program, env.get("PATH").map(String::as_str), &invocation.cwd)?;
        let env_keys: Vec<String> = env.keys().cloned().collect();

        let mut command = match &self.config.isolation {
            Isolation::Bubblewrap { bwrap } => {
                let wrapper = which::which(bwrap)
                    .map_err(|_| SandboxError::WrapperNotFound(bwrap.display().to_string()))?;
                let argv = wrap_args(&WrapSpec {
                    profile,
                    binary: &binary,
                    args: &invocation.args,
                    cwd: &invocation.cwd,
                    allow_read: &invocation.allow_read,
                    allow_write: &invocation.allow_write,
                    network: invocation.network,
                    uid: self.config.uid,
                    gid: self.config.gid,
                });
                let mut command = Command::new(wrapper);
                command.args(argv);
                command
            }
            Isolation::None => {
                let mut command = Command::new(&binary);
                command.args(&invocation.args);
                command
            }
        };
        command
            .current_dir(&invocation.cwd)
            .env_clear()
            .envs(&env);
        self.config.limits.install(&mut command);

        Ok(Prepared {
            binary,
            profile: profile.kind,
            command,
            env_keys,
        })
    }

    fn synthetic(
        &self,
        seq: u64,
        invocation: &Invocation,
        started_at: chrono::DateTime<Utc>,
        start: Instant,
        error: Option<SandboxError>,
        completion: Completion,
    ) -> Run {
        let exit_code = match completion {
            Completion::Cancelled => CANCELLED_EXIT,
            _ => SETUP_FAILED_EXIT,
        };
        Run {
            seq,
            tag: invocation.tag.clone(),
            program: invocation.program.clone(),
            binary: None,
            args: invocation.args.clone(),
            cwd: invocation.cwd.display().to_string(),
            profile: None,
            env_keys: Vec::new(),
            stdout: String::new(),
            stderr: error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            exit_code,
            term_signal: None,
            completion,
            marker: error.as_ref().map(SandboxError::marker),
            setup_error: error.map(|e| e.to_string()),
            log_path: None,
            started_at,
            ended_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn signal_number(name: Option<&str>) -> i32 {
    #[cfg(unix)]
    {
        use std::str::FromStr;
        name.and_then(|n| nix::sys::signal::Signal::from_str(n).ok())
            .map(|s| s as i32)
            .unwrap_or(0)
    }
    #[cfg(not(unix))]
    {
        let _ = name;
        0
    }
}
