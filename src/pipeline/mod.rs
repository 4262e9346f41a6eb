//! Stage engine.
//!
//! A build is an ordered list of [`OptimizationStage`]s. Each stage pairs a
//! declaration (name, whether it may run alongside its neighbours, whether
//! its failure aborts the build, timeout, retry budget) with a
//! [`StageAction`] that does the work against a shared [`BuildContext`].
//!
//! ## Stage lifecycle
//!
//! ```text
//! Pending ──► Running{1} ──► Succeeded
//!                │
//!                ▼ error / timeout
//!              Failed ──(retries left, after backoff)──► Running{2} ──► …
//!                │
//!                ▼ retries exhausted
//!              Failed
//!
//! Pending ──► Skipped        (not reached, or the action declined to run)
//! ```
//!
//! Every state a stage enters is recorded in its [`StageReport`], so the
//! full trace of a build is available afterwards.
//!
//! ## Execution modes
//!
//! Sequentially, stages run one at a time in declared order. With
//! parallelism enabled, each maximal run of consecutive parallelizable
//! stages forms a group that runs concurrently on a `JoinSet` and is joined
//! before the next group starts. A failing critical stage in a group cancels
//! its siblings through a child cancellation token; non-critical failures are
//! only collected.
//!
//! Each attempt is bounded by `min(stage.timeout, time left in the build)`.
//! A timeout counts as a retryable failure. Cancelling the build token stops
//! in-flight attempts and backoff sleeps immediately.
//!
//! Each attempt runs as its own task with a child token. An attempt that
//! times out or is cancelled has its token cancelled and is awaited before
//! the stage retries or reports, so stray work from one attempt never runs
//! alongside the next. Actions check their token between units of work.

pub mod context;
pub mod stages;

pub use context::{BuildContext, BuildState, TemplateDoc};

use crate::bundle::BundleError;
use crate::catalog::ScanError;
use crate::compress::CompressionError;
use crate::transform::TransformError;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a stage action reports when it returns normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    /// The action chose not to run (disabled by configuration).
    Skipped(String),
}

/// The work behind a stage.
#[async_trait]
pub trait StageAction: Send + Sync {
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> StageAction for FnAction<F>
where
    F: Fn(Arc<BuildContext>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutcome, StageError>> + Send + 'static,
{
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        (self.0)(ctx, cancel).await
    }
}

/// Wrap an async closure as a [`StageAction`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn StageAction>
where
    F: Fn(Arc<BuildContext>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StageOutcome, StageError>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// A named step of the build and the action that performs it.
#[derive(Clone)]
pub struct OptimizationStage {
    pub name: String,
    pub parallelizable: bool,
    pub critical: bool,
    pub timeout: Duration,
    pub max_retries: u32,
    pub action: Arc<dyn StageAction>,
}

impl OptimizationStage {
    /// A sequential, critical stage with a 60s timeout and no retries.
    pub fn new(name: impl Into<String>, action: Arc<dyn StageAction>) -> Self {
        Self {
            name: name.into(),
            parallelizable: false,
            critical: true,
            timeout: Duration::from_secs(60),
            max_retries: 0,
            action,
        }
    }

    pub fn parallelizable(mut self, yes: bool) -> Self {
        self.parallelizable = yes;
        self
    }

    pub fn critical(mut self, yes: bool) -> Self {
        self.critical = yes;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

impl fmt::Debug for OptimizationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizationStage")
            .field("name", &self.name)
            .field("parallelizable", &self.parallelizable)
            .field("critical", &self.critical)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running { attempt: u32 },
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Pending => f.write_str("pending"),
            StageState::Running { attempt } => write!(f, "running (attempt {attempt})"),
            StageState::Succeeded => f.write_str("succeeded"),
            StageState::Failed => f.write_str("failed"),
            StageState::Skipped => f.write_str("skipped"),
        }
    }
}

/// Trace of one stage through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub critical: bool,
    pub state: StageState,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Skip reason, when the action declined to run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub transitions: Vec<StageState>,
}

impl StageReport {
    fn pending(stage: &OptimizationStage) -> Self {
        Self {
            name: stage.name.clone(),
            critical: stage.critical,
            state: StageState::Pending,
            attempts: 0,
            duration_ms: 0,
            error: None,
            note: None,
            transitions: vec![StageState::Pending],
        }
    }

    /// Report for a stage the build never reached.
    pub fn skipped(stage: &OptimizationStage, reason: &str) -> Self {
        let mut report = Self::pending(stage);
        report.note = Some(reason.to_string());
        report.enter(StageState::Skipped);
        report
    }

    fn enter(&mut self, state: StageState) {
        debug!("stage {}: {} -> {}", self.name, self.state, state);
        self.state = state;
        self.transitions.push(state);
    }

    pub fn failed(&self) -> bool {
        self.state == StageState::Failed
    }
}

/// Delay before retry number `attempt + 1`, given the failed attempt number.
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// `attempt * step`.
pub fn linear_backoff(step: Duration) -> Backoff {
    Arc::new(move |attempt| step.saturating_mul(attempt))
}

pub fn no_backoff() -> Backoff {
    Arc::new(|_| Duration::ZERO)
}

/// Run one stage to completion: attempts, timeouts, retries and backoff.
pub async fn execute_stage(
    stage: &OptimizationStage,
    ctx: &Arc<BuildContext>,
    cancel: &CancellationToken,
    deadline: Instant,
    backoff: &Backoff,
) -> StageReport {
    let started = Instant::now();
    let mut report = StageReport::pending(stage);
    let mut attempt = 0;

    loop {
        attempt += 1;
        report.attempts = attempt;
        report.enter(StageState::Running { attempt });

        let limit = stage
            .timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let attempt_token = cancel.child_token();
        let mut task = spawn_attempt(stage, ctx, &attempt_token);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            timed = tokio::time::timeout(limit, &mut task) => match timed {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => Err(StageError::Join(err)),
                Err(_) => Err(StageError::Timeout(limit)),
            },
        };
        if !task.is_finished() {
            drain_attempt(&stage.name, &attempt_token, task).await;
        }

        match result {
            Ok(StageOutcome::Completed) => {
                report.error = None;
                report.enter(StageState::Succeeded);
                break;
            }
            Ok(StageOutcome::Skipped(reason)) => {
                info!("stage {} skipped: {reason}", stage.name);
                report.note = Some(reason);
                report.enter(StageState::Skipped);
                break;
            }
            Err(StageError::Cancelled) => {
                report.error = Some(StageError::Cancelled.to_string());
                report.enter(StageState::Failed);
                break;
            }
            Err(err) => {
                warn!("stage {} attempt {attempt} failed: {err}", stage.name);
                report.error = Some(err.to_string());
                report.enter(StageState::Failed);
                if attempt > stage.max_retries || Instant::now() >= deadline {
                    break;
                }
                let delay = backoff(attempt);
                debug!("stage {} retrying in {delay:?}", stage.name);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        report.error = Some(StageError::Cancelled.to_string());
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    report
}

/// How long an interrupted attempt gets to observe its token and stop
/// before it is abandoned.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type AttemptHandle = JoinHandle<Result<StageOutcome, StageError>>;

fn spawn_attempt(
    stage: &OptimizationStage,
    ctx: &Arc<BuildContext>,
    token: &CancellationToken,
) -> AttemptHandle {
    let action = Arc::clone(&stage.action);
    let ctx = Arc::clone(ctx);
    let token = token.clone();
    tokio::spawn(async move { action.run(ctx, token).await })
}

/// Cancel an attempt that timed out or was interrupted and wait for it to
/// wind down, so a retry never overlaps its predecessor's writes.
async fn drain_attempt(name: &str, token: &CancellationToken, mut task: AttemptHandle) {
    token.cancel();
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
        warn!("stage {name} did not stop within {DRAIN_TIMEOUT:?}, abandoning it");
        task.abort();
    }
}

/// Index ranges of stages that run together.
///
/// Sequential mode gives one range per stage. Parallel mode merges each
/// maximal run of consecutive parallelizable stages into one range.
pub fn plan_groups(stages: &[OptimizationStage], parallel: bool) -> Vec<Range<usize>> {
    let mut groups: Vec<Range<usize>> = Vec::new();
    for (i, stage) in stages.iter().enumerate() {
        let extend = parallel
            && stage.parallelizable
            && groups
                .last()
                .is_some_and(|g| g.end == i && stages[g.start].parallelizable);
        match groups.last_mut() {
            Some(group) if extend => group.end = i + 1,
            _ => groups.push(i..i + 1),
        }
    }
    groups
}

/// Result of running a stage list.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// One report per declared stage, in declared order.
    pub reports: Vec<StageReport>,
    /// First critical stage that failed, if any.
    pub failed_stage: Option<String>,
    pub cancelled: bool,
}

/// Execution settings for [`run_stages`].
#[derive(Clone)]
pub struct RunOptions {
    pub parallel: bool,
    pub build_timeout: Duration,
    pub backoff: Backoff,
}

/// Run `stages` against `ctx` in groups, stopping at the first critical
/// failure or on cancellation.
pub async fn run_stages(
    stages: &[OptimizationStage],
    ctx: &Arc<BuildContext>,
    cancel: &CancellationToken,
    options: &RunOptions,
) -> PipelineRun {
    let deadline = Instant::now() + options.build_timeout;
    let mut reports: Vec<Option<StageReport>> = vec![None; stages.len()];
    let mut failed_stage: Option<String> = None;

    for group in plan_groups(stages, options.parallel) {
        if failed_stage.is_some() || cancel.is_cancelled() {
            break;
        }

        if group.len() == 1 {
            let stage = &stages[group.start];
            info!("stage {} started", stage.name);
            let report = execute_stage(stage, ctx, cancel, deadline, &options.backoff).await;
            log_finished(&report);
            if report.failed() && stage.critical {
                failed_stage.get_or_insert_with(|| stage.name.clone());
            }
            ctx.record_stage(&report);
            reports[group.start] = Some(report);
            continue;
        }

        let names: Vec<&str> = stages[group.clone()].iter().map(|s| s.name.as_str()).collect();
        info!("stages {} started in parallel", names.join(", "));
        let siblings = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();
        for i in group.clone() {
            let stage = stages[i].clone();
            let ctx = Arc::clone(ctx);
            let token = siblings.clone();
            let backoff = Arc::clone(&options.backoff);
            let handle = tasks.spawn(async move {
                (i, execute_stage(&stage, &ctx, &token, deadline, &backoff).await)
            });
            task_index.insert(handle.id(), i);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (i, report) = match joined {
                Ok((_, done)) => done,
                Err(err) => {
                    let Some(&i) = task_index.get(&err.id()) else {
                        error!("stage task failed: {err}");
                        continue;
                    };
                    let mut report = StageReport::pending(&stages[i]);
                    report.attempts = 1;
                    report.enter(StageState::Running { attempt: 1 });
                    report.error = Some(StageError::Join(err).to_string());
                    report.enter(StageState::Failed);
                    (i, report)
                }
            };
            log_finished(&report);
            if report.failed() && stages[i].critical {
                siblings.cancel();
                failed_stage.get_or_insert_with(|| stages[i].name.clone());
            }
            ctx.record_stage(&report);
            reports[i] = Some(report);
        }
    }

    let cancelled = cancel.is_cancelled();
    let reason = if cancelled {
        "build cancelled"
    } else {
        "build aborted by a critical stage failure"
    };
    let reports = reports
        .into_iter()
        .zip(stages)
        .map(|(report, stage)| report.unwrap_or_else(|| StageReport::skipped(stage, reason)))
        .collect();

    PipelineRun {
        reports,
        failed_stage,
        cancelled,
    }
}

fn log_finished(report: &StageReport) {
    match (&report.state, &report.error) {
        (StageState::Failed, Some(err)) if report.critical => {
            error!("stage {} failed after {} attempt(s): {err}", report.name, report.attempts)
        }
        (StageState::Failed, Some(err)) => {
            warn!("stage {} failed after {} attempt(s): {err}", report.name, report.attempts)
        }
        (state, _) => info!("stage {} {state} in {}ms", report.name, report.duration_ms),
    }
}
