//! Status vocabulary for batch gradient updates and operator decisions.

use serde::{Deserialize, Serialize};

/// Result of a batch gradient update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Everything worked; data collection may proceed.
    Success,
    /// Something went wrong, but the operator asked to try again.
    Retry,
    /// Something went wrong; skip data for this sample, continue the procedure.
    Fail,
    /// Something went badly wrong; stop the procedure after the final restore.
    Abort,
    /// The attempt has not finished, or finished in an indeterminate state.
    Unknown,
}

impl Outcome {
    /// Short label used in logs and data-log headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Fail => "fail",
            Self::Abort => "abort",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator choice after a batch update left some cavities failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// Re-run the update for the failed cavities.
    Retry,
    /// Stop the whole procedure; only restore setpoints.
    Abort,
    /// Skip this sample, roll gradients back, continue the procedure.
    Skip,
    /// Treat the achieved gradients as good enough and collect data.
    Accept,
}

/// Operator choice when a bounded wait has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDecision {
    /// Restart the wait window.
    KeepWaiting,
    /// Give up and abort the operation.
    Abort,
}
