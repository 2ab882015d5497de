//! Retry policy and failure classification.
//!
//! The worker maps whatever went wrong into a [`FailureKind`]; the policy
//! classifies it and decides whether another attempt is worthwhile.

use std::time::Duration;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

/// Upper bound for any retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Exit codes for which a rerun fails the same way: host failures (2),
/// parser errors (4) and bad options (5).
pub const NON_RETRYABLE_EXIT_CODES: [i32; 3] = [2, 4, 5];

/// stderr fragments that identify playbook syntax or validation errors.
const SYNTAX_MARKERS: [&str; 6] = [
    "Syntax Error",
    "syntax error",
    "is not a valid attribute",
    "could not be found",
    "conflicting action statements",
    "couldn't resolve module/action",
];

/// What went wrong, as far as retrying is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The job was revoked.
    Cancelled,
    /// The worker ran out of something (memory, file descriptors, slots).
    ResourceExhausted(String),
    /// The target descriptor or its inputs are unusable.
    InvalidInput(String),
    /// The automation process exited non-zero.
    ProcessExit { exit_code: i32, stderr: String },
    /// The run exceeded its wall-clock limit.
    TimedOut,
    /// Spawn, store or other infrastructure failure.
    Infrastructure(String),
}

/// Outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Not a failure; the job ends `REVOKED`.
    Cancelled,
    /// Will fail identically on retry.
    Terminal,
    /// Worth another attempt.
    Retryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Classify a failure.
pub fn classify(kind: &FailureKind) -> FailureClass {
    match kind {
        FailureKind::Cancelled => FailureClass::Cancelled,
        FailureKind::ResourceExhausted(_) | FailureKind::InvalidInput(_) => FailureClass::Terminal,
        FailureKind::ProcessExit { exit_code, stderr } => {
            if NON_RETRYABLE_EXIT_CODES.contains(exit_code) || is_syntax_error(stderr) {
                FailureClass::Terminal
            } else {
                FailureClass::Retryable
            }
        }
        FailureKind::TimedOut | FailureKind::Infrastructure(_) => FailureClass::Retryable,
    }
}

/// Whether stderr carries a playbook syntax/validation error.
pub fn is_syntax_error(stderr: &str) -> bool {
    SYNTAX_MARKERS.iter().any(|m| stderr.contains(m))
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retries + 1`: `base * 2^retries`,
    /// capped at `max_delay`.
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide whether to retry after `retries` retries have already run.
    pub fn decide(&self, kind: &FailureKind, retries: u32) -> RetryDecision {
        match classify(kind) {
            FailureClass::Retryable if retries < self.max_retries => RetryDecision {
                retry: true,
                delay: self.backoff(retries),
            },
            _ => RetryDecision::give_up(),
        }
    }
}
