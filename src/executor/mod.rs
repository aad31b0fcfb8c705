//! Resilient page actions.
//!
//! An [`ActionDescriptor`] is executed by resolving its primary locator and
//! walking the strategy cascade (native, script, pointer). When the whole
//! cascade fails and fallbacks exist, a fresh page snapshot is taken and the
//! cascade runs exactly once more against the first fallback that resolves.
//! A stale handle buys one re-resolution per execution. Nothing here retries
//! with backoff.

pub mod strategy;
pub mod trace;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;

use crate::driver::{DriverError, ElementHandle, PageDriver};
use crate::models::{ActionDescriptor, ActionKind, Locator};

pub use strategy::Strategy;
pub use trace::{AttemptOutcome, AttemptRecord, Phase, Step};
use trace::Trace;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ActionValue {
    Clicked,
    Text(String),
}

impl ActionValue {
    pub fn into_text(self) -> Option<String> {
        match self {
            ActionValue::Text(text) => Some(text),
            ActionValue::Clicked => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ActionFailure {
    #[error("target not found")]
    NotFound,
    #[error("target present but not interactable")]
    Blocked,
    #[error("target detached before use")]
    Stale,
}

impl From<&DriverError> for ActionFailure {
    fn from(err: &DriverError) -> Self {
        match err {
            DriverError::NotFound(_) => ActionFailure::NotFound,
            DriverError::Stale => ActionFailure::Stale,
            DriverError::NotInteractable(_)
            | DriverError::Timeout
            | DriverError::Script(_)
            | DriverError::Transport(_) => ActionFailure::Blocked,
        }
    }
}

pub type ActionResult = Result<ActionValue, ActionFailure>;

struct CascadeRun {
    trace: Trace,
    stale_budget: u8,
}

pub struct ActionExecutor {
    driver: Arc<dyn PageDriver>,
    attempt_timeout: Duration,
    snapshot_dir: Option<PathBuf>,
    last_trace: Mutex<Vec<AttemptRecord>>,
}

impl ActionExecutor {
    pub fn new(driver: Arc<dyn PageDriver>, attempt_timeout: Duration) -> Self {
        Self {
            driver,
            attempt_timeout,
            snapshot_dir: None,
            last_trace: Mutex::new(Vec::new()),
        }
    }

    /// Dump the structural snapshot taken before fallback resolution into `dir`.
    pub fn with_snapshot_dir(mut self, dir: PathBuf) -> Self {
        self.snapshot_dir = Some(dir);
        self
    }

    pub async fn execute(&self, descriptor: &ActionDescriptor) -> ActionResult {
        let mut run = CascadeRun {
            trace: Trace::default(),
            stale_budget: 1,
        };
        let result = self.run(descriptor, &mut run).await;

        if let Err(failure) = &result {
            log_warn!(
                "{} on {} failed after {} attempts: {}",
                descriptor.kind.label(),
                descriptor.primary,
                run.trace.records.len(),
                failure
            );
        }

        let mut guard = match self.last_trace.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = run.trace.records;
        result
    }

    /// Runs a read descriptor and returns the value as text.
    pub async fn read(&self, descriptor: &ActionDescriptor) -> Result<String, ActionFailure> {
        let value = self.execute(descriptor).await?;
        value.into_text().ok_or(ActionFailure::Blocked)
    }

    /// Quiet read for polling, where a missing target is routine. Primary and
    /// fallbacks are tried in order as one phase; no snapshot is taken and
    /// [`last_trace`](Self::last_trace) keeps the last real action.
    pub async fn peek(&self, descriptor: &ActionDescriptor) -> Result<String, ActionFailure> {
        let mut run = CascadeRun {
            trace: Trace::default(),
            stale_budget: 1,
        };
        let locators: Vec<Locator> = std::iter::once(descriptor.primary.clone())
            .chain(descriptor.fallbacks.iter().cloned())
            .collect();
        let value = self
            .run_phase(Phase::Primary, &locators, &descriptor.kind, &mut run)
            .await?;
        value.into_text().ok_or(ActionFailure::Blocked)
    }

    pub async fn read_location(&self) -> Result<String, DriverError> {
        self.bounded(self.driver.current_location()).await
    }

    /// Diagnostic records of the most recent `execute` call.
    pub fn last_trace(&self) -> Vec<AttemptRecord> {
        match self.last_trace.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn run(&self, descriptor: &ActionDescriptor, run: &mut CascadeRun) -> ActionResult {
        let primary = std::slice::from_ref(&descriptor.primary);
        let failure = match self
            .run_phase(Phase::Primary, primary, &descriptor.kind, run)
            .await
        {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        if descriptor.fallbacks.is_empty() {
            return Err(failure);
        }

        self.capture_snapshot(&descriptor.primary, run).await;
        self.run_phase(Phase::Fallback, &descriptor.fallbacks, &descriptor.kind, run)
            .await
    }

    async fn run_phase(
        &self,
        phase: Phase,
        locators: &[Locator],
        kind: &ActionKind,
        run: &mut CascadeRun,
    ) -> ActionResult {
        let resolved = self.resolve_first(phase, locators, run).await;

        if phase == Phase::Fallback {
            let started = Instant::now();
            match &resolved {
                Some((locator, _)) => run.trace.record(
                    phase,
                    Step::FallbackReresolution,
                    locator,
                    AttemptOutcome::Success,
                    None,
                    started,
                ),
                None => run.trace.record(
                    phase,
                    Step::FallbackReresolution,
                    format!("{} fallbacks", locators.len()),
                    AttemptOutcome::Failure(ActionFailure::NotFound),
                    None,
                    started,
                ),
            }
        }

        let Some((locator, mut handle)) = resolved else {
            return Err(ActionFailure::NotFound);
        };

        loop {
            match self.cascade(phase, locator, &handle, kind, run).await {
                Err(ActionFailure::Stale) if run.stale_budget > 0 => {
                    run.stale_budget -= 1;
                    let started = Instant::now();
                    match self.bounded(self.driver.locate(locator)).await {
                        Ok(fresh) => {
                            run.trace.record(
                                phase,
                                Step::Reresolve,
                                locator,
                                AttemptOutcome::Success,
                                None,
                                started,
                            );
                            handle = fresh;
                        }
                        Err(err) => {
                            run.trace.record(
                                phase,
                                Step::Reresolve,
                                locator,
                                AttemptOutcome::Failure(ActionFailure::from(&err)),
                                Some(err.to_string()),
                                started,
                            );
                            return Err(ActionFailure::Stale);
                        }
                    }
                }
                other => return other,
            }
        }
    }

    async fn resolve_first<'a>(
        &self,
        phase: Phase,
        locators: &'a [Locator],
        run: &mut CascadeRun,
    ) -> Option<(&'a Locator, ElementHandle)> {
        for locator in locators {
            let started = Instant::now();
            match self.bounded(self.driver.locate(locator)).await {
                Ok(handle) => {
                    run.trace.record(
                        phase,
                        Step::Resolve,
                        locator,
                        AttemptOutcome::Success,
                        None,
                        started,
                    );
                    return Some((locator, handle));
                }
                Err(err) => run.trace.record(
                    phase,
                    Step::Resolve,
                    locator,
                    AttemptOutcome::Failure(ActionFailure::NotFound),
                    Some(err.to_string()),
                    started,
                ),
            }
        }
        None
    }

    /// First-success-wins over the strategies for `kind`. A stale handle stops
    /// the cascade early since every later strategy would hit the same handle.
    async fn cascade(
        &self,
        phase: Phase,
        locator: &Locator,
        handle: &ElementHandle,
        kind: &ActionKind,
        run: &mut CascadeRun,
    ) -> ActionResult {
        for strategy in Strategy::for_kind(kind) {
            let started = Instant::now();
            let attempt = strategy.attempt(self.driver.as_ref(), handle, kind);
            match self.bounded(attempt).await {
                Ok(value) => {
                    run.trace.record(
                        phase,
                        Step::Attempt(*strategy),
                        locator,
                        AttemptOutcome::Success,
                        None,
                        started,
                    );
                    return Ok(value);
                }
                Err(err) => {
                    let failure = ActionFailure::from(&err);
                    run.trace.record(
                        phase,
                        Step::Attempt(*strategy),
                        locator,
                        AttemptOutcome::Failure(failure),
                        Some(err.to_string()),
                        started,
                    );
                    if failure == ActionFailure::Stale {
                        return Err(ActionFailure::Stale);
                    }
                }
            }
        }
        Err(ActionFailure::Blocked)
    }

    async fn capture_snapshot(&self, locator: &Locator, run: &mut CascadeRun) {
        let started = Instant::now();
        match self.bounded(self.driver.page_snapshot()).await {
            Ok(source) => {
                run.trace.record(
                    Phase::Fallback,
                    Step::Snapshot,
                    locator,
                    AttemptOutcome::Success,
                    Some(format!("{} bytes", source.len())),
                    started,
                );
                if let Some(dir) = &self.snapshot_dir {
                    self.dump_snapshot(dir, locator, &source).await;
                }
            }
            // The fallback set is still worth trying without a snapshot.
            Err(err) => run.trace.record(
                Phase::Fallback,
                Step::Snapshot,
                locator,
                AttemptOutcome::Failure(ActionFailure::from(&err)),
                Some(err.to_string()),
                started,
            ),
        }
    }

    async fn dump_snapshot(&self, dir: &Path, locator: &Locator, source: &str) {
        let url = self.read_location().await.unwrap_or_default();
        let now = Local::now();
        let path = dir.join(format!("page_source_{}.html", now.format("%Y%m%d_%H%M%S")));
        let contents = format!(
            "<!-- URL: {url} -->\n<!-- saved: {} -->\n<!-- locator: {locator} -->\n\n{source}",
            now.format("%Y-%m-%d %H:%M:%S")
        );

        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, contents).await
        }
        .await;

        match result {
            Ok(()) => log_info!("Saved page snapshot to {}", path.display()),
            Err(err) => log_warn!("Failed to save page snapshot {}: {}", path.display(), err),
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        match tokio::time::timeout(self.attempt_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout),
        }
    }
}
