use std::fmt;
use std::time::Instant;

use super::strategy::Strategy;
use super::ActionFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Resolve,
    Attempt(Strategy),
    /// Same locator looked up again after a stale handle.
    Reresolve,
    Snapshot,
    /// Target picked from the fallback set after the primary cascade failed.
    FallbackReresolution,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Resolve => f.write_str("resolve"),
            Step::Attempt(strategy) => write!(f, "attempt:{}", strategy.label()),
            Step::Reresolve => f.write_str("reresolve"),
            Step::Snapshot => f.write_str("snapshot"),
            Step::FallbackReresolution => f.write_str("fallback-reresolution"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure(ActionFailure),
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub phase: Phase,
    pub step: Step,
    pub locator: String,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

/// Diagnostic records for one `execute` call.
#[derive(Debug, Default)]
pub(crate) struct Trace {
    pub records: Vec<AttemptRecord>,
}

impl Trace {
    pub fn record(
        &mut self,
        phase: Phase,
        step: Step,
        locator: impl fmt::Display,
        outcome: AttemptOutcome,
        detail: Option<String>,
        started: Instant,
    ) {
        let record = AttemptRecord {
            phase,
            step,
            locator: locator.to_string(),
            outcome,
            detail,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        log::debug!(
            target: "executor",
            "phase={:?} step={} locator={} outcome={:?} detail={} elapsed_ms={}",
            record.phase,
            record.step,
            record.locator,
            record.outcome,
            record.detail.as_deref().unwrap_or("-"),
            record.elapsed_ms
        );
        self.records.push(record);
    }
}
