//! The aggregated machine-state interlock.
//!
//! Every control-system channel the tool cares about reports into one shared
//! [`InterlockAggregator`] through hooks that fire on driver threads.  The
//! aggregator reduces everything to a single question — is the machine safe to
//! act on right now? — and to bounded waits built on that question.
//!
//! One mutex guards all categories.  Public methods lock once and delegate to
//! non-locking helpers, so hooks may fire from any number of driver threads
//! while a procedure polls.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use fedaq_core::decision::DecisionPort;
use fedaq_core::error::{DaqError, DaqResult};

/// At most this many example identifiers are listed per category in
/// diagnostics.  Enough to orient the operator without flooding the log.
pub const MAX_EXAMPLES: usize = 3;

/// Poll interval for [`InterlockAggregator::wait_and_assert_safe`].
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Poll interval for [`InterlockAggregator::monitor`].
const MONITOR_POLL: Duration = Duration::from_millis(100);

/// A recorded out-of-band reading on a watched channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdViolation {
    /// The offending reading.
    pub value: f64,
    /// Lower acceptable bound, if any.
    pub low: Option<f64>,
    /// Upper acceptable bound, if any.
    pub high: Option<f64>,
}

#[derive(Debug, Default)]
struct Categories {
    disconnected: BTreeSet<String>,
    rf_off: BTreeSet<String>,
    hv_bad: BTreeSet<String>,
    thresholds: BTreeMap<String, ThresholdViolation>,
}

impl Categories {
    fn is_safe(&self) -> bool {
        self.disconnected.is_empty()
            && self.rf_off.is_empty()
            && self.hv_bad.is_empty()
            && self.thresholds.is_empty()
    }
}

/// Count plus a deterministic sample of offending identifiers for one category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategorySummary {
    /// How many conditions are active in this category.
    pub total: usize,
    /// Up to [`MAX_EXAMPLES`] identifiers, in sorted order.
    pub examples: Vec<String>,
}

impl CategorySummary {
    fn from_names<'a>(names: impl ExactSizeIterator<Item = &'a String>) -> Self {
        let total = names.len();
        Self {
            total,
            examples: names.take(MAX_EXAMPLES).cloned().collect(),
        }
    }
}

/// Point-in-time copy of every interlock category, taken under the lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Channels whose connection is down.
    pub disconnected: CategorySummary,
    /// Cavities reporting RF off.
    pub rf_off: CategorySummary,
    /// High-voltage supplies reading outside their acceptable band.
    pub hv_bad: CategorySummary,
    /// Watched channels outside their configured thresholds.
    pub thresholds: CategorySummary,
}

impl StateSnapshot {
    /// True iff no category holds any active condition.
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.disconnected.total == 0
            && self.rf_off.total == 0
            && self.hv_bad.total == 0
            && self.thresholds.total == 0
    }
}

impl std::fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_safe() {
            return f.write_str("all channels nominal");
        }
        let mut first = true;
        for (label, summary) in [
            ("disconnected", &self.disconnected),
            ("rf_off", &self.rf_off),
            ("hv_bad", &self.hv_bad),
            ("threshold", &self.thresholds),
        ] {
            if summary.total == 0 {
                continue;
            }
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{label}: {} (e.g. {})", summary.total, summary.examples.join(", "))?;
        }
        Ok(())
    }
}

/// Shared machine-state registry.
///
/// Constructed once at startup and passed by reference to everything that
/// needs it; there is deliberately no global instance.
#[derive(Debug, Default)]
pub struct InterlockAggregator {
    inner: Mutex<Categories>,
}

impl InterlockAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Categories) -> T) -> T {
        // A poisoned lock means a driver hook panicked; the categories are
        // still internally consistent, so keep serving them.
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Record a channel connection edge.  Safe to call repeatedly with the
    /// same state; a restored connection leaves no residue.
    pub fn record_connection(&self, channel: &str, connected: bool) {
        self.with_inner(|c| {
            if connected {
                c.disconnected.remove(channel);
            } else {
                c.disconnected.insert(channel.to_string());
            }
        });
        if !connected {
            warn!(target: "fedaq", channel, "channel disconnected");
        }
    }

    /// Record an RF on/off readback for a cavity.
    pub fn record_rf_state(&self, cavity: &str, rf_on: bool) {
        self.with_inner(|c| {
            if rf_on {
                c.rf_off.remove(cavity);
            } else {
                c.rf_off.insert(cavity.to_string());
            }
        });
        if !rf_on {
            warn!(target: "fedaq", cavity, "RF reported off");
        }
    }

    /// Record a high-voltage supply readback state.
    pub fn record_hv_state(&self, supply: &str, good: bool) {
        self.with_inner(|c| {
            if good {
                c.hv_bad.remove(supply);
            } else {
                c.hv_bad.insert(supply.to_string());
            }
        });
    }

    /// Record an out-of-band reading on a watched channel.
    pub fn record_threshold_violation(&self, channel: &str, violation: ThresholdViolation) {
        warn!(
            target: "fedaq",
            channel,
            value = violation.value,
            "watched channel out of band"
        );
        self.with_inner(|c| {
            c.thresholds.insert(channel.to_string(), violation);
        });
    }

    /// Clear a previously recorded threshold violation.
    pub fn clear_threshold(&self, channel: &str) {
        self.with_inner(|c| {
            if c.thresholds.remove(channel).is_some() {
                debug!(target: "fedaq", channel, "watched channel recovered");
            }
        });
    }

    /// Single safety predicate: true iff every category is empty.
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.with_inner(|inner| inner.is_safe())
    }

    /// Copy out per-category counts and example identifiers.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        self.with_inner(|c| StateSnapshot {
            disconnected: CategorySummary::from_names(c.disconnected.iter()),
            rf_off: CategorySummary::from_names(c.rf_off.iter()),
            hv_bad: CategorySummary::from_names(c.hv_bad.iter()),
            thresholds: CategorySummary::from_names(c.thresholds.keys()),
        })
    }

    /// Fail (or consult the operator) unless the machine is safe.
    ///
    /// With a decision port, an unsafe state becomes a yes/no question;
    /// declining maps to [`DaqError::Aborted`].  Without one it is
    /// [`DaqError::Interlock`].
    pub fn assert_safe(&self, port: Option<&dyn DecisionPort>) -> DaqResult<()> {
        let snap = self.snapshot();
        if snap.is_safe() {
            return Ok(());
        }
        warn!(target: "fedaq", state = %snap, "machine state unsafe");
        match port {
            Some(port) => {
                if port.confirm(&format!("Machine state unsafe: {snap}. Continue anyway?")) {
                    Ok(())
                } else {
                    Err(DaqError::Aborted {
                        phase: "safety check".into(),
                        reason: snap.to_string(),
                    })
                }
            }
            None => Err(DaqError::Interlock {
                detail: snap.to_string(),
            }),
        }
    }

    /// Sleep for `duration` in 50 ms polls, failing fast on any violation,
    /// then assert safety once more.  This is the universal settle primitive.
    pub fn wait_and_assert_safe(
        &self,
        duration: Duration,
        port: Option<&dyn DecisionPort>,
    ) -> DaqResult<()> {
        self.poll_safe(duration, WAIT_POLL, port)
    }

    /// Watch the machine for `duration` at a 100 ms cadence.
    ///
    /// Returns early with an error (or an operator consultation) on the first
    /// violation instead of waiting out the window.
    pub fn monitor(&self, duration: Duration, port: Option<&dyn DecisionPort>) -> DaqResult<()> {
        self.poll_safe(duration, MONITOR_POLL, port)
    }

    fn poll_safe(
        &self,
        duration: Duration,
        poll: Duration,
        port: Option<&dyn DecisionPort>,
    ) -> DaqResult<()> {
        let start = Instant::now();
        loop {
            self.assert_safe(port)?;
            let remaining = duration.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(());
            }
            std::thread::sleep(remaining.min(poll));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedaq_core::decision::Scripted;
    use std::sync::Arc;

    #[test]
    fn fresh_aggregator_is_safe() {
        let agg = InterlockAggregator::new();
        assert!(agg.is_safe());
        assert!(agg.assert_safe(None).is_ok());
        assert_eq!(agg.snapshot().to_string(), "all channels nominal");
    }

    #[test]
    fn lost_then_restored_connection_leaves_no_residue() {
        let agg = InterlockAggregator::new();
        agg.record_connection("R1M1GMES", false);
        assert!(!agg.is_safe());

        agg.record_connection("R1M1GMES", true);
        assert!(agg.is_safe());
        assert!(agg.assert_safe(None).is_ok());
        assert_eq!(agg.snapshot(), StateSnapshot::default());
    }

    #[test]
    fn recording_is_idempotent() {
        let agg = InterlockAggregator::new();
        agg.record_rf_state("1L22-3", false);
        agg.record_rf_state("1L22-3", false);
        assert_eq!(agg.snapshot().rf_off.total, 1);

        agg.record_rf_state("1L22-3", true);
        assert!(agg.is_safe());
    }

    #[test]
    fn snapshot_caps_examples_at_three() {
        let agg = InterlockAggregator::new();
        for i in 0..7 {
            agg.record_connection(&format!("R1M{i}GSET"), false);
        }
        let snap = agg.snapshot();
        assert_eq!(snap.disconnected.total, 7);
        assert_eq!(snap.disconnected.examples.len(), MAX_EXAMPLES);
        // BTreeSet order makes the sample deterministic
        assert_eq!(snap.disconnected.examples[0], "R1M0GSET");
        let rendered = snap.to_string();
        assert!(rendered.contains("disconnected: 7"));
    }

    #[test]
    fn threshold_violations_record_and_clear() {
        let agg = InterlockAggregator::new();
        agg.record_threshold_violation(
            "R1XXJT.ORBV",
            ThresholdViolation {
                value: 90.0,
                low: None,
                high: Some(82.0),
            },
        );
        assert!(!agg.is_safe());
        assert_eq!(agg.snapshot().thresholds.total, 1);

        agg.clear_threshold("R1XXJT.ORBV");
        assert!(agg.is_safe());
        // clearing twice is harmless
        agg.clear_threshold("R1XXJT.ORBV");
        assert!(agg.is_safe());
    }

    #[test]
    fn assert_safe_without_port_is_an_interlock_error() {
        let agg = InterlockAggregator::new();
        agg.record_hv_state("INX1L22", false);
        let err = agg.assert_safe(None).unwrap_err();
        match err {
            DaqError::Interlock { detail } => assert!(detail.contains("hv_bad")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn assert_safe_with_port_honors_the_operator() {
        let agg = InterlockAggregator::new();
        agg.record_rf_state("1L22-5", false);

        let port = Scripted::new();
        port.push_confirm(true);
        assert!(agg.assert_safe(Some(&port)).is_ok());

        // queue exhausted: operator declines, which is an abort
        let err = agg.assert_safe(Some(&port)).unwrap_err();
        assert!(err.is_abort());
    }

    #[test]
    fn wait_and_assert_safe_passes_a_quiet_window() {
        let agg = InterlockAggregator::new();
        assert!(agg.wait_and_assert_safe(Duration::from_millis(20), None).is_ok());
        // zero-duration settle is a plain safety check
        assert!(agg.wait_and_assert_safe(Duration::ZERO, None).is_ok());
    }

    #[test]
    fn monitor_fails_fast_on_violation() {
        let agg = Arc::new(InterlockAggregator::new());
        let saboteur = Arc::clone(&agg);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            saboteur.record_connection("R1M1GMES", false);
        });

        let start = Instant::now();
        let err = agg.monitor(Duration::from_secs(30), None).unwrap_err();
        assert!(matches!(err, DaqError::Interlock { .. }));
        assert!(start.elapsed() < Duration::from_secs(5), "should not wait out the window");
        handle.join().unwrap();
    }

    #[test]
    fn interleaved_connect_disconnect_settles_safe() {
        let agg = Arc::new(InterlockAggregator::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let agg = Arc::clone(&agg);
            handles.push(std::thread::spawn(move || {
                let channel = format!("R1M{t}GSET");
                for _ in 0..200 {
                    agg.record_connection(&channel, false);
                    agg.record_connection(&channel, true);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(agg.is_safe());
        assert!(agg.assert_safe(None).is_ok());
    }
}
