//! tex-lane: preflight and sandboxed compilation of TeX submissions
//!
//! An unpacked submission tree goes through classification (which file is
//! what, which files are entry points, which engine), dependency resolution
//! against the tree and the installed toolchain, and bounded multi-pass
//! compilation with every external tool run inside a sandbox. The result is
//! a replayable [`outcome::Outcome`] record.

pub mod config;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod outcome;
pub mod pipeline;
pub mod preflight;
pub mod resolver;
pub mod submission;
pub mod timeout;

pub use config::{EffectiveConfig, LaneConfig};
pub use outcome::{ExitCode, Outcome, Status};
pub use pipeline::{CompileRequest, Pipeline, PipelineError};
pub use submission::{CompilationPlan, Engine, Submission};
