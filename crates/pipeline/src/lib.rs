//! Platboot pipeline: a fail-fast sequence of idempotent provisioning steps
//! and the canonical cluster bootstrap built on it.

#![forbid(unsafe_code)]

pub mod bootstrap;
mod engine;
pub mod resources;

pub use bootstrap::{steps, Bootstrap, Collaborators};
pub use engine::{
    Pipeline, PipelineError, PipelineState, RunReport, SkipFn, Step, StepContext, StepFn, StepOutcome, StepRecord,
};

use platboot_core::PipelineConfig;
use tokio_util::sync::CancellationToken;
use tracing::info_span;

/// Run the bootstrap once and return its report alongside the outcome.
pub async fn run_with_report(
    config: PipelineConfig,
    collaborators: Collaborators,
    cancel: CancellationToken,
) -> (RunReport, Result<(), PipelineError>) {
    let span = info_span!("bootstrap", namespace = %config.namespace);
    let ctx = Bootstrap::new(config, collaborators, cancel, span.clone());
    let mut pipeline = Pipeline::new(steps(), span);
    let res = pipeline.run(&ctx).await;
    (pipeline.report().clone(), res)
}

/// Run the bootstrap once. Validation failures run no step; otherwise the
/// first failing step is reported with its name.
pub async fn run(config: PipelineConfig, collaborators: Collaborators, cancel: CancellationToken) -> Result<(), PipelineError> {
    run_with_report(config, collaborators, cancel).await.1
}
