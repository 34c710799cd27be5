//! Ordered, fail-fast step runner.

use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use platboot_core::{BootError, BootResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, Span};
use uuid::Uuid;

pub type StepFn<C> = for<'a> fn(&'a C) -> BoxFuture<'a, BootResult<()>>;
pub type SkipFn<C> = fn(&C) -> bool;

/// What a pipeline runs against: validated once before the first step,
/// consulted for cancellation before each step.
pub trait StepContext: Send + Sync {
    fn validate(&self) -> BootResult<()> { Ok(()) }
    fn is_canceled(&self) -> bool { false }
}

pub struct Step<C> {
    pub name: &'static str,
    pub action: StepFn<C>,
    pub skip: SkipFn<C>,
}

fn never<C>(_: &C) -> bool { false }

impl<C> Step<C> {
    pub fn new(name: &'static str, action: StepFn<C>) -> Self { Self { name, action, skip: never::<C> } }

    pub fn skip_when(mut self, skip: SkipFn<C>) -> Self {
        self.skip = skip;
        self
    }
}

impl<C> std::fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("Step").field("name", &self.name).finish() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    /// Index of the step currently executing.
    Running(usize),
    Succeeded,
    Failed { step: String, cause: BootError },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidConfig(#[source] BootError),
    #[error("step {step} failed: {source}")]
    StepFailed { step: String, source: BootError },
}

impl PipelineError {
    pub fn is_canceled(&self) -> bool { matches!(self, PipelineError::StepFailed { source: BootError::Canceled, .. }) }

    /// Name of the failed step; `None` for configuration errors.
    pub fn step(&self) -> Option<&str> {
        match self {
            PipelineError::InvalidConfig(_) => None,
            PipelineError::StepFailed { step, .. } => Some(step),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Per-run trace of what each step did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    fn start() -> Self { Self { run_id: Uuid::new_v4(), started_at: Utc::now(), finished_at: None, steps: Vec::new() } }

    pub fn outcome_of(&self, step: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }
}

pub struct Pipeline<C> {
    steps: Vec<Step<C>>,
    state: PipelineState,
    report: RunReport,
    span: Span,
}

impl<C: StepContext> Pipeline<C> {
    pub fn new(steps: Vec<Step<C>>, span: Span) -> Self {
        Self { steps, state: PipelineState::Pending, report: RunReport::start(), span }
    }

    pub fn state(&self) -> &PipelineState { &self.state }

    pub fn report(&self) -> &RunReport { &self.report }

    /// Run every step in order from the first. A run always starts over;
    /// skipped steps never invoke their action, and the first failure stops
    /// the pipeline.
    pub async fn run(&mut self, ctx: &C) -> Result<(), PipelineError> {
        self.state = PipelineState::Pending;
        self.report = RunReport::start();
        if let Err(e) = ctx.validate() {
            error!(parent: &self.span, error = %e, "configuration rejected");
            self.report.finished_at = Some(Utc::now());
            return Err(PipelineError::InvalidConfig(e));
        }
        info!(parent: &self.span, run_id = %self.report.run_id, steps = self.steps.len(), "pipeline started");

        for (idx, step) in self.steps.iter().enumerate() {
            self.state = PipelineState::Running(idx);
            let started_at = Utc::now();
            let t0 = Instant::now();
            if (step.skip)(ctx) {
                info!(parent: &self.span, step = step.name, "step skipped");
                counter!("pipeline_step_total", 1u64, "step" => step.name, "outcome" => "skipped");
                self.report.steps.push(StepRecord { step: step.name.into(), outcome: StepOutcome::Skipped, started_at, duration_ms: 0 });
                continue;
            }
            let res = if ctx.is_canceled() {
                Err(BootError::Canceled)
            } else {
                info!(parent: &self.span, step = step.name, index = idx, "step started");
                (step.action)(ctx).await
            };
            let ms = t0.elapsed().as_millis() as u64;
            histogram!("pipeline_step_ms", ms as f64, "step" => step.name);
            match res {
                Ok(()) => {
                    info!(parent: &self.span, step = step.name, duration_ms = ms, "step finished");
                    counter!("pipeline_step_total", 1u64, "step" => step.name, "outcome" => "ok");
                    self.report.steps.push(StepRecord { step: step.name.into(), outcome: StepOutcome::Succeeded, started_at, duration_ms: ms });
                }
                Err(cause) => {
                    error!(parent: &self.span, step = step.name, error = %cause, duration_ms = ms, "step failed");
                    counter!("pipeline_step_total", 1u64, "step" => step.name, "outcome" => "failed");
                    self.report.steps.push(StepRecord {
                        step: step.name.into(),
                        outcome: StepOutcome::Failed { error: cause.to_string() },
                        started_at,
                        duration_ms: ms,
                    });
                    self.report.finished_at = Some(Utc::now());
                    self.state = PipelineState::Failed { step: step.name.into(), cause: cause.clone() };
                    return Err(PipelineError::StepFailed { step: step.name.into(), source: cause });
                }
            }
        }

        self.state = PipelineState::Succeeded;
        self.report.finished_at = Some(Utc::now());
        debug!(parent: &self.span, run_id = %self.report.run_id, "pipeline succeeded");
        Ok(())
    }
}
