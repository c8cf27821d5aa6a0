//! Outcome status and stable exit codes

use serde::{Deserialize, Serialize};

/// Status of one plan or of the whole submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Every plan converged and delivered its output
    Success,
    /// Output was delivered, but something stopped short
    Partial,
    /// No usable output
    Failure,
}

impl Status {
    /// Get the exit code for this status
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Status::Success => ExitCode::Success,
            Status::Partial => ExitCode::Partial,
            Status::Failure => ExitCode::Failure,
        }
    }

    /// Aggregate of plan statuses: the worst one wins, and no plans is a failure.
    pub fn aggregate<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        statuses.into_iter().max().unwrap_or(Status::Failure)
    }

    /// Lowers `Success` to `Partial`; leaves the others alone.
    pub fn degrade(self) -> Status {
        match self {
            Status::Success => Status::Partial,
            other => other,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failure)
    }
}

/// Stable exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Every plan converged
    Success = 0,
    /// Output delivered with warnings
    Partial = 10,
    /// No usable output
    Failure = 20,
    /// Bad command line or configuration
    Usage = 30,
}

impl ExitCode {
    /// Get the integer value of the exit code
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Create from integer value
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            10 => Some(ExitCode::Partial),
            20 => Some(ExitCode::Failure),
            30 => Some(ExitCode::Usage),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}
