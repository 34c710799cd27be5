//! Platboot apply: idempotent "create or accept existing" for single resources,
//! with an optional post-creation phase gate.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use platboot_core::{BootError, BootResult, CreateOutcome, ResourceDescriptor, ResourceStore};
use platboot_retry::{retry_notify, Backoff};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Span};

/// What a freshly created resource must report before it counts as ensured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostCondition {
    #[default]
    None,
    /// `status.phase` equals `expected` (e.g. a namespace being `Active`).
    Phase { expected: String },
    /// `status.conditions[type == type_].status == "True"` (e.g. a schema being `Established`).
    Condition { type_: String },
}

impl PostCondition {
    pub fn phase(expected: &str) -> Self { Self::Phase { expected: expected.to_string() } }
    pub fn condition(type_: &str) -> Self { Self::Condition { type_: type_.to_string() } }

    /// Check a fetched object against the condition.
    pub fn check(&self, what: &str, obj: &Json) -> BootResult<()> {
        match self {
            PostCondition::None => Ok(()),
            PostCondition::Phase { expected } => {
                let observed = obj.pointer("/status/phase").and_then(|v| v.as_str()).unwrap_or("<none>");
                if observed == expected {
                    Ok(())
                } else {
                    Err(BootError::PhaseNotReady { what: what.to_string(), expected: expected.clone(), observed: observed.to_string() })
                }
            }
            PostCondition::Condition { type_ } => {
                let observed = obj
                    .pointer("/status/conditions")
                    .and_then(|v| v.as_array())
                    .and_then(|conds| conds.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_.as_str())))
                    .and_then(|c| c.get("status").and_then(|s| s.as_str()))
                    .unwrap_or("<none>");
                if observed == "True" {
                    Ok(())
                } else {
                    Err(BootError::PhaseNotReady {
                        what: what.to_string(),
                        expected: format!("{}=True", type_),
                        observed: format!("{}={}", type_, observed),
                    })
                }
            }
        }
    }
}

/// Creates resources so that pre-existence counts as success.
pub struct ResourceEnsurer {
    store: Arc<dyn ResourceStore>,
    cancel: CancellationToken,
    span: Span,
}

impl ResourceEnsurer {
    pub fn new(store: Arc<dyn ResourceStore>, cancel: CancellationToken, span: Span) -> Self {
        Self { store, cancel, span }
    }

    /// Create `desc` unless it already exists, then (only when this call created
    /// it) wait for `post` under the same `backoff` budget.
    ///
    /// Calling this twice with the same descriptor yields the same end state
    /// and never fails on the second call.
    pub async fn ensure(&self, desc: &ResourceDescriptor, post: &PostCondition, mut backoff: Backoff) -> BootResult<CreateOutcome> {
        let t0 = Instant::now();
        let what = desc.display_name();
        debug!(parent: &self.span, resource = %what, "ensuring resource");
        let created = AtomicBool::new(false);
        let res = retry_notify(
            &mut backoff,
            &self.cancel,
            || self.attempt(desc, post, &what, &created),
            |e, wait| debug!(parent: &self.span, resource = %what, error = %e, retry_in = ?wait, "ensure attempt failed"),
        )
        .await
        .map_err(|e| e.exhausted(&format!("ensuring {}", what)));
        histogram!("ensure_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(CreateOutcome::Created) => {
                counter!("ensure_total", 1u64, "outcome" => "created");
                info!(parent: &self.span, resource = %what, "created");
            }
            Ok(CreateOutcome::AlreadyExists) => {
                counter!("ensure_total", 1u64, "outcome" => "exists");
                debug!(parent: &self.span, resource = %what, "already exists");
            }
            Err(e) => {
                counter!("ensure_total", 1u64, "outcome" => "failed");
                debug!(parent: &self.span, resource = %what, error = %e, "ensure failed");
            }
        }
        res
    }

    /// Ensure each descriptor in order, each with a fresh backoff. Stops at the first failure.
    pub async fn ensure_all<B>(&self, descs: &[ResourceDescriptor], post: &PostCondition, backoff: B) -> BootResult<()>
    where
        B: Fn() -> Backoff,
    {
        for d in descs {
            self.ensure(d, post, backoff()).await?;
        }
        Ok(())
    }

    async fn attempt(&self, desc: &ResourceDescriptor, post: &PostCondition, what: &str, created: &AtomicBool) -> BootResult<CreateOutcome> {
        if !created.load(Ordering::SeqCst) {
            match self.store.create(desc).await? {
                CreateOutcome::AlreadyExists => return Ok(CreateOutcome::AlreadyExists),
                CreateOutcome::Created => created.store(true, Ordering::SeqCst),
            }
        }
        if *post != PostCondition::None {
            let obj = self
                .store
                .get(&desc.kind, desc.namespace.as_deref(), &desc.name)
                .await?
                .ok_or_else(|| BootError::NotFound(what.to_string()))?;
            post.check(what, &obj)?;
        }
        Ok(CreateOutcome::Created)
    }
}
