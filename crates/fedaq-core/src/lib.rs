//! Shared vocabulary for the fe-daq gradient automation workspace.
//!
//! This crate defines the signal-link boundary ([`SignalLink`], [`SimChannel`]),
//! the unified error type ([`DaqError`]), the batch-status and operator-decision
//! enums, the configuration tree ([`DaqConfig`]), and the tracing conventions
//! used across all fe-daq crates.
//!
//! It has minimal external dependencies and is intended to be depended on by
//! every other crate in the workspace.

pub mod config;
pub mod decision;
pub mod error;
pub mod outcome;
pub mod signal;
pub mod tracing_config;

pub use config::{DaqConfig, FamilyParams, FamilyTable, LinacLimits, RampConfig, RecoveryConfig, ZoneLimits};
pub use decision::{DecisionPort, DenyAll, Scripted};
pub use error::{DaqError, DaqResult};
pub use outcome::{BatchDecision, Outcome, WaitDecision};
pub use signal::{ConnectionHook, SignalLink, SimChannel, ValueHook, wait_for_all};
