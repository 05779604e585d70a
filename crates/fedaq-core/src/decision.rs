//! Operator decision seam.
//!
//! Procedures never talk to a console directly.  Anywhere a workflow would
//! stop and ask the operator (a ramp timeout, a failed batch update, an unsafe
//! machine state) the code consults a [`DecisionPort`] instead.  Worker
//! threads are always run without a port so they can never block on a prompt.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::outcome::{BatchDecision, WaitDecision};

/// How operator decisions reach running procedures.
///
/// Implementations must be safe to share across threads; the saga keeps one
/// port for its whole lifetime while worker threads run portless.
pub trait DecisionPort: Send + Sync {
    /// A bounded wait expired (ramp, tuner).  `context` names the wait.
    fn on_wait_expired(&self, context: &str) -> WaitDecision;

    /// A batch update finished with failed cavities.  `failed` holds their names.
    fn on_batch_failure(&self, failed: &[String]) -> BatchDecision;

    /// Yes/no question, e.g. "continue despite unsafe state?" or
    /// "rollback failed, try again?".
    fn confirm(&self, prompt: &str) -> bool;
}

/// Non-interactive port: every consultation picks the conservative answer.
///
/// Waits abort, batch failures abort, confirmations decline.  This is the port
/// used by unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl DecisionPort for DenyAll {
    fn on_wait_expired(&self, _context: &str) -> WaitDecision {
        WaitDecision::Abort
    }

    fn on_batch_failure(&self, _failed: &[String]) -> BatchDecision {
        BatchDecision::Abort
    }

    fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// Queued-response port for driving procedures from tests.
///
/// Each consultation pops the front of its queue; an empty queue falls back to
/// the [`DenyAll`] answer.
#[derive(Debug, Default)]
pub struct Scripted {
    waits: Mutex<VecDeque<WaitDecision>>,
    batches: Mutex<VecDeque<BatchDecision>>,
    confirms: Mutex<VecDeque<bool>>,
}

impl Scripted {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_wait(&self, decision: WaitDecision) {
        if let Ok(mut q) = self.waits.lock() {
            q.push_back(decision);
        }
    }

    pub fn push_batch(&self, decision: BatchDecision) {
        if let Ok(mut q) = self.batches.lock() {
            q.push_back(decision);
        }
    }

    pub fn push_confirm(&self, answer: bool) {
        if let Ok(mut q) = self.confirms.lock() {
            q.push_back(answer);
        }
    }
}

impl DecisionPort for Scripted {
    fn on_wait_expired(&self, _context: &str) -> WaitDecision {
        self.waits
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(WaitDecision::Abort)
    }

    fn on_batch_failure(&self, _failed: &[String]) -> BatchDecision {
        self.batches
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(BatchDecision::Abort)
    }

    fn confirm(&self, _prompt: &str) -> bool {
        self.confirms
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(false)
    }
}
