//! Hook factories that feed channel events into the aggregator.
//!
//! Each factory captures an `Arc<InterlockAggregator>` and returns a boxed
//! closure suitable for registration on a [`SignalLink`].  Hooks run on driver
//! threads: they only classify the reading and update the registry, never
//! block, never prompt.
//!
//! [`SignalLink`]: fedaq_core::signal::SignalLink

use std::sync::Arc;

use fedaq_core::signal::{ConnectionHook, ValueHook};

use crate::aggregator::{InterlockAggregator, ThresholdViolation};

/// Track connection edges for any channel.
#[must_use]
pub fn connection_hook(agg: Arc<InterlockAggregator>) -> ConnectionHook {
    Box::new(move |channel, connected| {
        agg.record_connection(channel, connected);
    })
}

/// Track an RF on/off readback channel.  A reading of exactly 1 means on.
#[must_use]
pub fn rf_on_hook(agg: Arc<InterlockAggregator>, cavity: impl Into<String>) -> ValueHook {
    let cavity = cavity.into();
    Box::new(move |_channel, value| {
        agg.record_rf_state(&cavity, value == 1.0);
    })
}

/// Track a high-voltage readback.  Supplies read near -1000 V when healthy;
/// anything outside [900, 1100] by magnitude means the supply has sagged.
#[must_use]
pub fn hv_readback_hook(agg: Arc<InterlockAggregator>, supply: impl Into<String>) -> ValueHook {
    let supply = supply.into();
    Box::new(move |_channel, value| {
        let magnitude = value.abs();
        agg.record_hv_state(&supply, (900.0..=1100.0).contains(&magnitude));
    })
}

/// Watch a channel against optional low/high bounds.
///
/// A reading below `low` or above `high` records a violation under the
/// channel's own name; a reading back in band clears it.  `low == high` pins a
/// channel to a single acceptable value (tuner auto mode, fault summaries).
#[must_use]
pub fn threshold_hook(
    agg: Arc<InterlockAggregator>,
    low: Option<f64>,
    high: Option<f64>,
) -> ValueHook {
    Box::new(move |channel, value| {
        let below = low.is_some_and(|low| value < low);
        let above = high.is_some_and(|high| value > high);
        if below || above {
            agg.record_threshold_violation(channel, ThresholdViolation { value, low, high });
        } else {
            agg.clear_threshold(channel);
        }
    })
}
