//! Machine-state aggregation for fe-daq.
//!
//! One [`InterlockAggregator`] instance collects connection, RF, high-voltage,
//! and threshold conditions from driver-thread hooks and answers the single
//! question every procedure asks before touching a gradient: is the machine
//! safe right now?

pub mod aggregator;
pub mod hooks;

pub use aggregator::{
    CategorySummary, InterlockAggregator, MAX_EXAMPLES, StateSnapshot, ThresholdViolation,
};
pub use hooks::{connection_hook, hv_readback_hook, rf_on_hook, threshold_hook};
