//! Parallel gradient updates across a batch of cavities.
//!
//! One worker thread per cavity, each running the full validated, safety-gated
//! `set_gradient` path.  Workers never prompt; every consultation happens at
//! the batch level in the caller.  A batch is only a success when every cavity
//! landed, and retries prune cavities that succeed the second time around.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use fedaq_core::error::{DaqError, DaqResult};
use fedaq_core::outcome::Outcome;
use fedaq_interlock::InterlockAggregator;
use fedaq_machine::{Cavity, RampOptions};

/// Pause before each batch so any in-flight channel updates land first.
const PRE_BATCH_SLEEP: Duration = Duration::from_millis(100);

/// What a batch attempt produced.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub outcome: Outcome,
    /// Names of cavities whose update failed, ordered.
    pub failed: BTreeSet<String>,
}

impl BatchResult {
    fn success() -> Self {
        Self {
            outcome: Outcome::Success,
            failed: BTreeSet::new(),
        }
    }
}

/// Apply `targets` to `cavities` in parallel.
///
/// The machine state is checked once up front; an unsafe state fails the whole
/// batch without touching anything.  Worker errors are logged per cavity and
/// collected into the failed set.  A worker hitting an operator abort turns
/// the whole batch outcome into [`Outcome::Abort`].
pub fn apply_batch(
    cavities: &[Arc<Cavity>],
    targets: &BTreeMap<String, f64>,
    opts: &RampOptions,
    interlocks: &InterlockAggregator,
) -> DaqResult<BatchResult> {
    for cavity in cavities {
        if !targets.contains_key(cavity.name()) {
            return Err(DaqError::Inventory {
                detail: format!("no target gradient supplied for {}", cavity.name()),
            });
        }
    }

    std::thread::sleep(PRE_BATCH_SLEEP);

    if let Err(err) = interlocks.assert_safe(None) {
        error!(target: "fedaq", error = %err, "machine unsafe, refusing batch update");
        return Ok(BatchResult {
            outcome: if err.is_abort() {
                Outcome::Abort
            } else {
                Outcome::Fail
            },
            failed: cavities.iter().map(|c| c.name().to_string()).collect(),
        });
    }

    let mut failed = BTreeSet::new();
    let mut aborted = false;
    std::thread::scope(|scope| {
        let handles: Vec<_> = cavities
            .iter()
            .map(|cavity| {
                let target = targets[cavity.name()];
                debug!(target: "fedaq", cavity = %cavity.name(), gset = target, "submitting update");
                scope.spawn(move || cavity.set_gradient(target, opts, None))
            })
            .collect();
        for (cavity, handle) in cavities.iter().zip(handles) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(
                        target: "fedaq",
                        cavity = %cavity.name(),
                        error = %err,
                        "gradient update failed"
                    );
                    if err.is_abort() {
                        aborted = true;
                    }
                    failed.insert(cavity.name().to_string());
                }
                Err(_) => {
                    error!(target: "fedaq", cavity = %cavity.name(), "update worker panicked");
                    failed.insert(cavity.name().to_string());
                }
            }
        }
    });

    if aborted {
        Ok(BatchResult {
            outcome: Outcome::Abort,
            failed,
        })
    } else if failed.is_empty() {
        Ok(BatchResult::success())
    } else {
        Ok(BatchResult {
            outcome: Outcome::Fail,
            failed,
        })
    }
}
