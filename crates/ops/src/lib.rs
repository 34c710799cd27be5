//! Platboot ops: imperative cluster operations used after installation,
//! waiting for a workload to become ready and patching operator deployments.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use platboot_core::{BootError, BootResult, PatchOp, ResourceStore, WorkloadRef, WorkloadStatusSource};
use platboot_retry::{retry_notify, Backoff};
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Span};

pub const DEPLOYMENT_KIND: &str = "apps/v1/Deployment";

/// Polls a workload at a fixed interval until its ready replica count
/// matches the desired count.
pub struct ReadinessPoller {
    source: Arc<dyn WorkloadStatusSource>,
    cancel: CancellationToken,
    span: Span,
}

impl ReadinessPoller {
    pub fn new(source: Arc<dyn WorkloadStatusSource>, cancel: CancellationToken, span: Span) -> Self {
        Self { source, cancel, span }
    }

    /// Wait until `workload` reports `ready == desired`, where desired is
    /// `target` when given and otherwise the workload's own desired count.
    /// The interval never grows, and a status call still pending when
    /// `timeout` runs out is abandoned.
    pub async fn wait_until_ready<N>(
        &self,
        workload: &WorkloadRef,
        target: Option<u32>,
        interval: Duration,
        timeout: Duration,
        notify: N,
    ) -> BootResult<()>
    where
        N: FnMut(&BootError, Duration),
    {
        let t0 = tokio::time::Instant::now();
        let mut backoff = Backoff::constant(timeout, interval);
        info!(parent: &self.span, %workload, ?target, ?interval, ?timeout, "waiting for workload");
        let res = retry_notify(&mut backoff, &self.cancel, || self.poll_once(workload, target), notify).await;
        histogram!("readiness_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                counter!("readiness_wait_total", 1u64, "outcome" => "ready");
                info!(parent: &self.span, %workload, waited = ?t0.elapsed(), "workload ready");
                Ok(())
            }
            Err(BootError::Canceled) => Err(BootError::Canceled),
            Err(e @ BootError::ReplicasNotReady { .. }) => {
                counter!("readiness_wait_total", 1u64, "outcome" => "timeout");
                Err(BootError::failed(e.to_string()))
            }
            Err(e) => {
                counter!("readiness_wait_total", 1u64, "outcome" => "failed");
                Err(e.exhausted(&format!("waiting for {}", workload)))
            }
        }
    }

    async fn poll_once(&self, workload: &WorkloadRef, target: Option<u32>) -> BootResult<()> {
        let status = self.source.get_workload(&workload.namespace, &workload.name).await?;
        let desired = target.unwrap_or(status.desired_replicas);
        debug!(parent: &self.span, %workload, desired, ready = status.ready_replicas, "workload status");
        if status.ready_replicas == desired {
            Ok(())
        } else {
            Err(BootError::ReplicasNotReady { desired, ready: status.ready_replicas })
        }
    }
}

/// Ops resetting a deployment's pod DNS settings to the cluster default.
pub fn dns_reset_ops() -> Vec<PatchOp> {
    vec![
        PatchOp::Remove { path: "/spec/template/spec/dnsConfig".into() },
        PatchOp::Replace { path: "/spec/template/spec/dnsPolicy".into(), value: json!("ClusterFirst") },
    ]
}

/// Label selector matching the deployment of a release.
pub fn instance_selector(release: &str) -> String { format!("app.kubernetes.io/instance={}", release) }

/// Patches exactly one deployment found by label selector.
pub struct DeploymentPatcher {
    store: Arc<dyn ResourceStore>,
    cancel: CancellationToken,
    span: Span,
}

impl DeploymentPatcher {
    pub fn new(store: Arc<dyn ResourceStore>, cancel: CancellationToken, span: Span) -> Self {
        Self { store, cancel, span }
    }

    /// List deployments in `namespace` matching `label_selector` and apply
    /// `ops` to the single match. No match is retried (the deployment may not
    /// exist yet); several matches fail immediately. Returns the patched name.
    pub async fn patch_single_deployment(
        &self,
        namespace: &str,
        label_selector: &str,
        ops: &[PatchOp],
        mut backoff: Backoff,
    ) -> BootResult<String> {
        let name = retry_notify(
            &mut backoff,
            &self.cancel,
            || self.patch_once(namespace, label_selector, ops),
            |e, wait| debug!(parent: &self.span, selector = label_selector, error = %e, retry_in = ?wait, "deployment patch pending"),
        )
        .await
        .map_err(|e| e.exhausted(&format!("patching deployment {}/{}", namespace, label_selector)))?;
        counter!("deployment_patch_total", 1u64);
        info!(parent: &self.span, namespace, deployment = %name, "deployment patched");
        Ok(name)
    }

    async fn patch_once(&self, namespace: &str, label_selector: &str, ops: &[PatchOp]) -> BootResult<String> {
        let items = self.store.list(DEPLOYMENT_KIND, Some(namespace), Some(label_selector)).await?;
        let name = match items.as_slice() {
            [] => return Err(BootError::NotFound(format!("deployment matching {:?} in {}", label_selector, namespace))),
            [one] => object_name(one)?,
            many => {
                let names: Vec<String> = many.iter().filter_map(|o| object_name(o).ok()).collect();
                return Err(BootError::failed(format!(
                    "expected one deployment matching {:?} in {}, found {}: {}",
                    label_selector,
                    namespace,
                    many.len(),
                    names.join(", ")
                )));
            }
        };
        self.store.patch(DEPLOYMENT_KIND, Some(namespace), &name, ops).await?;
        Ok(name)
    }
}

fn object_name(obj: &Json) -> BootResult<String> {
    obj.pointer("/metadata/name")
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or_else(|| BootError::failed("listed deployment has no metadata.name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use platboot_core::mock::{MemoryStore, ScriptedWorkloads};
    use platboot_core::{ResourceDescriptor, WorkloadStatus};

    fn st(desired: u32, ready: u32) -> WorkloadStatus { WorkloadStatus { desired_replicas: desired, ready_replicas: ready } }

    fn poller(src: &Arc<ScriptedWorkloads>, cancel: CancellationToken) -> ReadinessPoller {
        ReadinessPoller::new(src.clone(), cancel, Span::none())
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_a_few_polls() {
        let src = Arc::new(ScriptedWorkloads::new());
        src.script("giantswarm", "chartmuseum", vec![st(1, 0), st(1, 0), st(1, 1)]);
        let mut waits = Vec::new();
        let wl = WorkloadRef::new("giantswarm", "chartmuseum");
        poller(&src, CancellationToken::new())
            .wait_until_ready(&wl, None, Duration::from_secs(10), Duration::from_secs(300), |_, w| waits.push(w))
            .await
            .unwrap();
        assert_eq!(src.polls(), 3);
        assert_eq!(waits, vec![Duration::from_secs(10); 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_target_overrides_desired() {
        let src = Arc::new(ScriptedWorkloads::new());
        src.script("ns", "w", vec![st(3, 1), st(3, 2)]);
        let wl = WorkloadRef::new("ns", "w");
        poller(&src, CancellationToken::new())
            .wait_until_ready(&wl, Some(2), Duration::from_secs(1), Duration::from_secs(60), |_, _| {})
            .await
            .unwrap();
        assert_eq!(src.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scaled_to_zero_is_ready_immediately() {
        let src = Arc::new(ScriptedWorkloads::new());
        src.script("ns", "w", vec![st(0, 0)]);
        let wl = WorkloadRef::new("ns", "w");
        let t0 = tokio::time::Instant::now();
        poller(&src, CancellationToken::new())
            .wait_until_ready(&wl, None, Duration::from_secs(10), Duration::from_secs(60), |_, _| {})
            .await
            .unwrap();
        assert_eq!(src.polls(), 1);
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    struct StuckSource;

    #[async_trait::async_trait]
    impl WorkloadStatusSource for StuckSource {
        async fn get_workload(&self, _namespace: &str, _name: &str) -> BootResult<WorkloadStatus> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(WorkloadStatus { desired_replicas: 1, ready_replicas: 1 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_status_call_does_not_outlive_the_timeout() {
        let wl = WorkloadRef::new("ns", "w");
        let t0 = tokio::time::Instant::now();
        let err = ReadinessPoller::new(Arc::new(StuckSource), CancellationToken::new(), Span::none())
            .wait_until_ready(&wl, None, Duration::from_secs(10), Duration::from_secs(300), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::ExecutionFailed(ref m) if m.starts_with("waiting for ns/w")), "err={:?}", err);
        assert!(t0.elapsed() < Duration::from_secs(301), "elapsed {:?}", t0.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn constant_interval_times_out_after_five_minutes() {
        let src = Arc::new(ScriptedWorkloads::new());
        src.script("ns", "w", vec![st(1, 0)]);
        let wl = WorkloadRef::new("ns", "w");
        let t0 = tokio::time::Instant::now();
        let err = poller(&src, CancellationToken::new())
            .wait_until_ready(&wl, None, Duration::from_secs(10), Duration::from_secs(300), |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err, BootError::failed("waiting for 1 ready, current 0"));
        assert!(t0.elapsed() >= Duration::from_secs(300), "elapsed {:?}", t0.elapsed());
        assert!((29..=31).contains(&src.polls()), "polls {}", src.polls());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_workload_is_retried_then_fails() {
        let src = Arc::new(ScriptedWorkloads::new());
        let wl = WorkloadRef::new("ns", "ghost");
        let err = poller(&src, CancellationToken::new())
            .wait_until_ready(&wl, None, Duration::from_secs(5), Duration::from_secs(20), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::ExecutionFailed(ref m) if m.starts_with("waiting for ns/ghost")), "err={:?}", err);
        assert_eq!(src.polls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_waiting() {
        let src = Arc::new(ScriptedWorkloads::new());
        src.script("ns", "w", vec![st(1, 0)]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });
        let t0 = tokio::time::Instant::now();
        let err = poller(&src, cancel)
            .wait_until_ready(&WorkloadRef::new("ns", "w"), None, Duration::from_secs(10), Duration::from_secs(300), |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err, BootError::Canceled);
        assert!(t0.elapsed() < Duration::from_secs(30));
    }

    fn deployment(name: &str, instance: &str) -> ResourceDescriptor {
        ResourceDescriptor::namespaced(
            DEPLOYMENT_KIND,
            "giantswarm",
            name,
            json!({
                "metadata": { "labels": { "app.kubernetes.io/instance": instance } },
                "spec": { "template": { "spec": { "dnsPolicy": "None", "dnsConfig": { "nameservers": ["1.1.1.1"] } } } }
            }),
        )
    }

    fn patcher(store: &Arc<MemoryStore>) -> DeploymentPatcher {
        DeploymentPatcher::new(store.clone(), CancellationToken::new(), Span::none())
    }

    #[tokio::test(start_paused = true)]
    async fn patches_the_single_match() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&deployment("chart-operator", "chart-operator")).unwrap();
        store.insert(&deployment("app-operator", "app-operator")).unwrap();
        let name = patcher(&store)
            .patch_single_deployment("giantswarm", &instance_selector("chart-operator"), &dns_reset_ops(), Backoff::max_retries(3, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(name, "chart-operator");
        let obj = store.object(DEPLOYMENT_KIND, Some("giantswarm"), "chart-operator").unwrap();
        assert_eq!(obj["spec"]["template"]["spec"], json!({ "dnsPolicy": "ClusterFirst" }));
        let untouched = store.object(DEPLOYMENT_KIND, Some("giantswarm"), "app-operator").unwrap();
        assert_eq!(untouched["spec"]["template"]["spec"]["dnsPolicy"], "None");
    }

    #[tokio::test(start_paused = true)]
    async fn no_match_is_retried_until_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let err = patcher(&store)
            .patch_single_deployment("giantswarm", &instance_selector("chart-operator"), &dns_reset_ops(), Backoff::max_retries(2, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::ExecutionFailed(_)), "err={:?}", err);
        assert_eq!(store.count("list"), 3);
        assert_eq!(store.count("patch"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn several_matches_fail_without_retry() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&deployment("a", "chart-operator")).unwrap();
        store.insert(&deployment("b", "chart-operator")).unwrap();
        let err = patcher(&store)
            .patch_single_deployment("giantswarm", &instance_selector("chart-operator"), &dns_reset_ops(), Backoff::max_retries(5, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::ExecutionFailed(ref m) if m.contains("found 2: a, b")), "err={:?}", err);
        assert_eq!(store.count("list"), 1);
    }
}
