//! The apply / collect / rollback saga around one sample.
//!
//! A sample moves a set of cavities, holds still while the archiver records,
//! and puts everything back.  Failures in the apply phase go to the decision
//! port (retry the failures, skip the sample, accept what landed, or abort the
//! whole scan); the rollback is attempted no matter how the apply phase ended,
//! so an abort still leaves the machine at its starting gradients.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use fedaq_core::decision::DecisionPort;
use fedaq_core::error::{DaqError, DaqResult};
use fedaq_core::outcome::{BatchDecision, Outcome};
use fedaq_interlock::InterlockAggregator;
use fedaq_machine::{Cavity, RampOptions};

use crate::datalog::DataLog;
use crate::orchestrator::apply_batch;
use crate::procedures::settle_and_average;

/// Everything one sample needs: who moves, where to, and where back to.
pub struct SamplePlan {
    pub cavities: Vec<Arc<Cavity>>,
    pub new_gsets: BTreeMap<String, f64>,
    pub old_gsets: BTreeMap<String, f64>,
}

impl SamplePlan {
    #[must_use]
    pub fn cavity_names(&self) -> Vec<String> {
        self.cavities.iter().map(|c| c.name().to_string()).collect()
    }

    #[must_use]
    pub fn epics_names(&self) -> Vec<String> {
        self.cavities
            .iter()
            .map(|c| c.epics_name().to_string())
            .collect()
    }
}

/// Run one sample end to end: apply the plan, collect if it succeeded, and
/// roll the gradients back.  Returns the apply outcome; `DaqError::Aborted`
/// means the operator ended the scan (the rollback has already been tried).
pub fn collect_with_rollback(
    plan: &SamplePlan,
    opts: &RampOptions,
    settle_s: f64,
    avg_s: f64,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
    log: &mut DataLog,
) -> DaqResult<Outcome> {
    let outcome = apply_phase(plan, opts, interlocks, port)?;

    if outcome == Outcome::Success {
        info!(target: "fedaq", "begin settle and data collection period");
        let window = settle_and_average(interlocks, settle_s, avg_s, Some(port))?;
        log.write_row(&window, &plan.cavity_names(), &plan.epics_names())?;
    }

    rollback_phase(plan, opts, interlocks, port)?;

    if outcome == Outcome::Abort {
        return Err(DaqError::Aborted {
            phase: "gradient update".into(),
            reason: "operator aborted the scan".into(),
        });
    }
    Ok(outcome)
}

/// Drive `apply_batch` until the plan lands, the operator settles for what
/// landed, or the operator gives up.  Retries re-run only the cavities that
/// failed the previous attempt.
fn apply_phase(
    plan: &SamplePlan,
    opts: &RampOptions,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
) -> DaqResult<Outcome> {
    let mut pending: Vec<Arc<Cavity>> = plan.cavities.clone();
    loop {
        info!(target: "fedaq", cavities = pending.len(), "attempting cavity updates");
        let result = apply_batch(&pending, &plan.new_gsets, opts, interlocks)?;
        match result.outcome {
            Outcome::Success => return Ok(Outcome::Success),
            Outcome::Abort => return Ok(Outcome::Abort),
            _ => {}
        }

        warn!(
            target: "fedaq",
            failed_count = result.failed.len(),
            "cavities had problems updating"
        );
        let failed: Vec<String> = result.failed.iter().cloned().collect();
        match port.on_batch_failure(&failed) {
            BatchDecision::Retry => {
                pending.retain(|c| result.failed.contains(c.name()));
            }
            BatchDecision::Abort => return Ok(Outcome::Abort),
            BatchDecision::Skip => return Ok(Outcome::Fail),
            BatchDecision::Accept => return Ok(Outcome::Success),
        }
    }
}

/// Put every cavity in the plan back to its old gradient, retrying on the
/// operator's say-so.  Declining the retry aborts the scan.
fn rollback_phase(
    plan: &SamplePlan,
    opts: &RampOptions,
    interlocks: &InterlockAggregator,
    port: &dyn DecisionPort,
) -> DaqResult<()> {
    loop {
        info!(target: "fedaq", "attempting cavity gradient rollback");
        let result = apply_batch(&plan.cavities, &plan.old_gsets, opts, interlocks)?;
        if result.outcome == Outcome::Success {
            return Ok(());
        }
        warn!(
            target: "fedaq",
            outcome = %result.outcome,
            failed_count = result.failed.len(),
            "rollback attempt failed"
        );
        if !port.confirm("rollback failed, try again?") {
            return Err(DaqError::Aborted {
                phase: "rollback".into(),
                reason: "operator gave up restoring gradients".into(),
            });
        }
    }
}
