//! Log inspection for TeX tool runs.
//!
//! Two concerns live here, both pure functions over log text:
//! - classifying a failed run's log into a closed [`ErrorKind`] taxonomy via an
//!   ordered signature table (first match wins), and
//! - detecting "rerun needed" and auxiliary-processor requests through the
//!   [`LogSignals`] capability, so the orchestrator state machine never looks at
//!   log text directly.

mod excerpt;
mod signals;
mod signature;

pub use excerpt::{excerpt, tail_lines};
pub use signals::{AuxKind, LogSignals, TexLogSignals};
pub use signature::{
    classify, classify_with, ClassifiedError, ErrorKind, Signature, SignatureError,
    SignatureSpec, SignatureTable, DEFAULT_EXCERPT_LINES,
};

/// Reads a log file as text, tolerating invalid UTF-8.
///
/// TeX logs routinely contain bytes in the document's input encoding.
pub fn read_log(path: &std::path::Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
