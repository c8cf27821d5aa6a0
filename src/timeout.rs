//! Time budgets for one submission
//!
//! - `invocation_seconds`: wall-clock limit for a single external invocation
//! - `overall_seconds`: budget for the whole submission (resolution, every
//!   plan, post-processing)
//! - `termination_grace_seconds`: time between SIGTERM and SIGKILL
//!
//! The enforcer only reports; the orchestrator's watchdog turns an expired
//! budget into a cancellation of in-flight invocations.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Limit per external invocation (default: 300)
    pub invocation_seconds: u64,

    /// Budget for the whole submission (default: 595)
    pub overall_seconds: u64,

    /// Grace between SIGTERM and SIGKILL (default: 5)
    pub termination_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            invocation_seconds: 300,
            overall_seconds: 595,
            termination_grace_seconds: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        if self.overall_seconds == 0 || self.overall_seconds > 86400 {
            return Err(TimeoutValidationError::OverallOutOfBounds {
                value: self.overall_seconds,
            });
        }

        if self.invocation_seconds == 0 || self.invocation_seconds > self.overall_seconds {
            return Err(TimeoutValidationError::InvocationOutOfBounds {
                value: self.invocation_seconds,
                max: self.overall_seconds,
            });
        }

        if self.termination_grace_seconds > 60 {
            return Err(TimeoutValidationError::GraceOutOfBounds {
                value: self.termination_grace_seconds,
            });
        }

        Ok(())
    }

    pub fn invocation(&self) -> Duration {
        Duration::from_secs(self.invocation_seconds)
    }

    pub fn overall(&self) -> Duration {
        Duration::from_secs(self.overall_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("overall_seconds must be in (0, 86400], got {value}")]
    OverallOutOfBounds { value: u64 },

    #[error("invocation_seconds must be in (0, {max}], got {value}")]
    InvocationOutOfBounds { value: u64, max: u64 },

    #[error("termination_grace_seconds must be at most 60, got {value}")]
    GraceOutOfBounds { value: u64 },
}

/// Timeout check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    Ok,
    /// The submission budget is spent
    OverallTimeout,
}

impl TimeoutStatus {
    pub fn is_timeout(&self) -> bool {
        !matches!(self, TimeoutStatus::Ok)
    }
}

/// Tracks the submission budget.
#[derive(Debug, Clone)]
pub struct TimeoutEnforcer {
    config: TimeoutConfig,
    start_time: Instant,
}

impl TimeoutEnforcer {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            start_time: Instant::now(),
        }
    }

    pub fn check(&self) -> TimeoutStatus {
        if self.elapsed() > self.config.overall() {
            TimeoutStatus::OverallTimeout
        } else {
            TimeoutStatus::Ok
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn overall_remaining(&self) -> Duration {
        self.config.overall().saturating_sub(self.elapsed())
    }

    /// Limit for the next invocation: the per-invocation limit, capped by what is left.
    pub fn invocation_budget(&self) -> Duration {
        self.config.invocation().min(self.overall_remaining())
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }
}
