/// Unified error type covering all failure modes across the fe-daq gradient pipeline.
///
/// Every variant includes an actionable message guiding the operator toward resolution.
/// Procedures treat `Aborted` specially: it unwinds nested retry loops without triggering
/// an extra rollback at each level, and only the outermost restore sweep still runs.
#[derive(Debug, thiserror::Error)]
pub enum DaqError {
    // === Gradient request errors ===
    /// A requested gradient failed pre-write validation.  Nothing was written.
    #[error("{cavity}: gradient request rejected — {reason}")]
    Validation {
        /// Which cavity rejected the request.
        cavity: String,
        /// Why the request is not viable.
        reason: String,
    },

    // === Machine state errors ===
    /// The aggregated machine state is unsafe for control actions.
    #[error("Machine state unsafe: {detail}. Resolve the listed conditions before continuing.")]
    Interlock {
        /// Per-category counts and example identifiers.
        detail: String,
    },

    /// RF is off at a cavity that was asked to report ramp or gradient status.
    #[error("RF is off at {cavity}. Restore RF before changing gradients.")]
    RfOff {
        /// The cavity with RF off.
        cavity: String,
    },

    // === Waiting errors ===
    /// A bounded wait expired before the watched condition recovered.
    #[error("Timed out after {waited_s}s waiting for {operation}.")]
    Timeout {
        /// What was being waited on (JT valve, linac pressure, tuner, ramp, ...).
        operation: String,
        /// How long the wait ran, in seconds.
        waited_s: f64,
    },

    // === Connection errors ===
    /// A control-system channel failed to connect within the allowed window.
    #[error("Channel {channel} failed to connect within {timeout_s}s. Check the IOC and network.")]
    Disconnected {
        /// The channel that never connected.
        channel: String,
        /// The connection window, in seconds.
        timeout_s: f64,
    },

    /// A channel read produced no usable value.
    #[error("Read failed on {channel}: {detail}")]
    SignalRead {
        /// The channel that failed.
        channel: String,
        /// What went wrong.
        detail: String,
    },

    /// A channel write was rejected or lost.
    #[error("Write failed on {channel}: {detail}")]
    SignalWrite {
        /// The channel that failed.
        channel: String,
        /// What went wrong.
        detail: String,
    },

    // === Operator abort ===
    /// The operator chose to stop.  Unwinds the whole procedure; only the final
    /// best-effort restore still runs.
    #[error("Operator abort during {phase}: {reason}")]
    Aborted {
        /// Which phase was active when the operator aborted.
        phase: String,
        /// The recorded reason.
        reason: String,
    },

    // === Configuration errors ===
    /// A configuration value is invalid.
    #[error("Invalid config: {field} = \"{value}\" — {reason}")]
    InvalidConfig {
        /// Which config field.
        field: String,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    // === Group safety errors ===
    /// Proposed gradients would change a cryomodule's aggregate heat load by
    /// more than the budget allows, in either direction.
    #[error(
        "{zone}: proposed gradients change cryomodule heat by {percent:.1}% (budget {limit}%): {old_w:.1}W -> {new_w:.1}W"
    )]
    HeatBudget {
        /// The zone whose budget was exceeded.
        zone: String,
        /// Relative heat change, percent (signed).
        percent: f64,
        /// Allowed magnitude of change, percent.
        limit: f64,
        /// Aggregate heat at current gradients, watts.
        old_w: f64,
        /// Aggregate heat at proposed gradients, watts.
        new_w: f64,
    },

    // === Inventory errors ===
    /// The machine inventory could not be assembled into a usable linac.
    #[error("Inventory error: {detail}")]
    Inventory {
        /// What is wrong with the records.
        detail: String,
    },

    // === I/O errors ===
    /// Wraps `std::io::Error` for data-log and config file operations.
    #[error("I/O error: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// True for the distinguished operator-abort variant.
    ///
    /// Callers use this to skip per-level rollback and let the abort propagate.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Shorthand for a [`DaqError::Timeout`] with a `Duration` wait.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, waited: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited_s: waited.as_secs_f64(),
        }
    }
}

/// Convenience alias used throughout the fe-daq crate hierarchy.
pub type DaqResult<T> = Result<T, DaqError>;
