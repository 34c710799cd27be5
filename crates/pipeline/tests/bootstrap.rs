use std::sync::Arc;

use platboot_core::mock::{MemoryStore, ScriptedWorkloads, StubInstaller};
use platboot_core::{BootError, InstallOptions, PipelineConfig, ResourceDescriptor, WorkloadStatus};
use platboot_pipeline::{bootstrap, run, run_with_report, Collaborators, PipelineError, StepOutcome};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const CRD_KIND: &str = "apiextensions.k8s.io/v1/CustomResourceDefinition";

struct Fixture {
    store: Arc<MemoryStore>,
    installer: Arc<StubInstaller>,
    workloads: Arc<ScriptedWorkloads>,
}

impl Fixture {
    /// A cluster that behaves: schemas establish, namespaces go active, the
    /// chart operator's deployment exists and the workload turns ready.
    fn healthy() -> Self {
        let store = Arc::new(MemoryStore::new());
        store.script_status(CRD_KIND, vec![json!({ "conditions": [{ "type": "Established", "status": "True" }] })]);
        store.script_status("v1/Namespace", vec![json!({ "phase": "Active" })]);
        store.add_capability("policy", "v1beta1");
        store
            .insert(&ResourceDescriptor::namespaced(
                "apps/v1/Deployment",
                "giantswarm",
                "chart-operator",
                json!({
                    "metadata": { "labels": { "app.kubernetes.io/instance": "chart-operator" } },
                    "spec": { "template": { "spec": { "dnsPolicy": "None", "dnsConfig": { "nameservers": ["8.8.8.8"] } } } }
                }),
            ))
            .unwrap();
        let workloads = Arc::new(ScriptedWorkloads::new());
        workloads.script("giantswarm", "chartmuseum-chartmuseum", vec![ready(0), ready(1)]);
        Self { store, installer: Arc::new(StubInstaller::new()), workloads }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators { store: self.store.clone(), installer: self.installer.clone(), workloads: self.workloads.clone() }
    }
}

fn ready(n: u32) -> WorkloadStatus { WorkloadStatus { desired_replicas: 1, ready_replicas: n } }

fn config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.schemas.push(ResourceDescriptor::cluster(
        CRD_KIND,
        "appcatalogs.application.giantswarm.io",
        json!({ "spec": { "group": "application.giantswarm.io" } }),
    ));
    cfg
}

#[tokio::test(start_paused = true)]
async fn bootstrap_runs_every_step_in_order() {
    let fx = Fixture::healthy();
    let (report, res) = run_with_report(config(), fx.collaborators(), CancellationToken::new()).await;
    res.unwrap();

    assert_eq!(
        fx.store.calls(),
        vec![
            "create apiextensions.k8s.io/v1/CustomResourceDefinition appcatalogs.application.giantswarm.io",
            "get apiextensions.k8s.io/v1/CustomResourceDefinition appcatalogs.application.giantswarm.io",
            "create scheduling.k8s.io/v1/PriorityClass giantswarm-critical",
            "create v1/Namespace giantswarm",
            "get v1/Namespace giantswarm",
            "list apps/v1/Deployment app.kubernetes.io/instance=chart-operator",
            "patch apps/v1/Deployment chart-operator",
            "create application.giantswarm.io/v1alpha1/AppCatalog chartmuseum",
            "probe policy/v1beta1",
            "create policy/v1beta1/PodSecurityPolicy chartmuseum-psp",
            "create rbac.authorization.k8s.io/v1/ClusterRole chartmuseum-psp",
            "create rbac.authorization.k8s.io/v1/ClusterRoleBinding chartmuseum-psp",
            "create networking.k8s.io/v1/NetworkPolicy chartmuseum",
        ]
    );
    assert_eq!(
        fx.installer.calls(),
        vec![
            "resolve app-operator@2.3.2",
            "install app-operator",
            "delete /tmp/app-operator-2.3.2.tgz",
            "resolve chart-operator@2.3.3",
            "install chart-operator",
            "delete /tmp/chart-operator-2.3.3.tgz",
            "resolve chartmuseum@2.13.3",
            "install chartmuseum",
            "delete /tmp/chartmuseum-2.13.3.tgz",
        ]
    );
    assert_eq!(fx.workloads.polls(), 2);

    let patched = fx.store.object("apps/v1/Deployment", Some("giantswarm"), "chart-operator").unwrap();
    assert_eq!(patched["spec"]["template"]["spec"], json!({ "dnsPolicy": "ClusterFirst" }));

    let names: Vec<_> = report.steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(
        names,
        vec![
            bootstrap::ENSURE_SCHEMAS,
            bootstrap::ENSURE_PRIORITY_CLASS,
            bootstrap::ENSURE_NAMESPACE,
            bootstrap::INSTALL_OPERATORS,
            bootstrap::PATCH_OPERATOR_DEPLOYMENT,
            bootstrap::INSTALL_REPOSITORY_ENTRIES,
            bootstrap::ENSURE_ACCESS_POLICIES,
            bootstrap::INSTALL_WORKLOAD,
            bootstrap::WAIT_FOR_WORKLOAD,
        ]
    );
    assert!(report.steps.iter().all(|s| s.outcome == StepOutcome::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn operators_disabled_skips_install_and_patch() {
    let fx = Fixture::healthy();
    let mut cfg = config();
    cfg.install_operators = false;
    let (report, res) = run_with_report(cfg, fx.collaborators(), CancellationToken::new()).await;
    res.unwrap();

    assert_eq!(fx.installer.count("install"), 1);
    assert_eq!(fx.installer.installed_releases(), vec!["chartmuseum"]);
    assert_eq!(fx.store.count("list"), 0);
    assert_eq!(fx.store.count("patch"), 0);
    assert_eq!(report.outcome_of(bootstrap::INSTALL_OPERATORS), Some(&StepOutcome::Skipped));
    assert_eq!(report.outcome_of(bootstrap::PATCH_OPERATOR_DEPLOYMENT), Some(&StepOutcome::Skipped));
}

#[tokio::test(start_paused = true)]
async fn readiness_wait_can_be_disabled() {
    let fx = Fixture::healthy();
    let mut cfg = config();
    cfg.wait_for_readiness = false;
    run(cfg, fx.collaborators(), CancellationToken::new()).await.unwrap();
    assert_eq!(fx.workloads.polls(), 0);
}

#[tokio::test(start_paused = true)]
async fn workload_install_timeout_is_passed_to_the_installer() {
    let fx = Fixture::healthy();
    let mut cfg = config();
    cfg.workload.install_timeout_secs = Some(600);
    run(cfg, fx.collaborators(), CancellationToken::new()).await.unwrap();
    assert_eq!(
        fx.installer.install_options("chartmuseum"),
        Some(InstallOptions { wait: true, timeout: Some(std::time::Duration::from_secs(600)) })
    );
    assert_eq!(fx.installer.install_options("chart-operator"), Some(InstallOptions::default()));
}

#[tokio::test(start_paused = true)]
async fn existing_operator_release_counts_as_success() {
    let fx = Fixture::healthy();
    fx.installer.already_installed("chart-operator");
    run(config(), fx.collaborators(), CancellationToken::new()).await.unwrap();
    assert_eq!(fx.installer.count("status chart-operator"), 1);
    assert_eq!(fx.installer.count("delete /tmp/chart-operator"), 1);
}

#[tokio::test(start_paused = true)]
async fn stuck_namespace_stops_the_pipeline() {
    let fx = Fixture::healthy();
    fx.store.script_status("v1/Namespace", vec![json!({ "phase": "Terminating" })]);
    let (report, res) = run_with_report(config(), fx.collaborators(), CancellationToken::new()).await;
    let err = res.unwrap_err();

    assert_eq!(err.step(), Some(bootstrap::ENSURE_NAMESPACE));
    assert!(matches!(err, PipelineError::StepFailed { source: BootError::ExecutionFailed(ref m), .. } if m.contains("Terminating")), "err={:?}", err);
    assert!(fx.installer.calls().is_empty());
    assert_eq!(fx.store.count("create application.giantswarm.io"), 0);
    assert_eq!(fx.store.count("create v1/Namespace"), 1);
    assert_eq!(report.outcome_of(bootstrap::INSTALL_OPERATORS), None);
}

#[tokio::test(start_paused = true)]
async fn failed_operator_install_is_not_retried() {
    let fx = Fixture::healthy();
    fx.installer.fail_install("app-operator", BootError::failed("chart requires kubeVersion >= 1.30"));
    let err = run(config(), fx.collaborators(), CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.step(), Some(bootstrap::INSTALL_OPERATORS));
    assert_eq!(fx.installer.count("install"), 1);
    assert_eq!(fx.installer.count("delete"), 1);
    assert_eq!(fx.store.count("list"), 0);
}

#[tokio::test(start_paused = true)]
async fn rerun_is_idempotent() {
    let fx = Fixture::healthy();
    run(config(), fx.collaborators(), CancellationToken::new()).await.unwrap();
    let after_first = fx.store.snapshot();

    run(config(), fx.collaborators(), CancellationToken::new()).await.unwrap();
    assert_eq!(fx.store.snapshot(), after_first);
    assert_eq!(fx.store.count("create v1/Namespace"), 2);
    // The second run finds the namespace and does not re-verify its phase.
    assert_eq!(fx.store.count("get v1/Namespace"), 1);
    assert_eq!(fx.installer.count("install chartmuseum"), 2);
    assert_eq!(fx.installer.count("status chartmuseum"), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_config_touches_nothing() {
    let fx = Fixture::healthy();
    let mut cfg = config();
    cfg.namespace = " ".into();
    let err = run(cfg, fx.collaborators(), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(BootError::InvalidConfig(_))), "err={:?}", err);
    assert!(fx.store.calls().is_empty());
    assert!(fx.installer.calls().is_empty());
    assert_eq!(fx.workloads.polls(), 0);
}

#[tokio::test(start_paused = true)]
async fn without_pod_security_api_only_network_policy_is_created() {
    let fx = Fixture::healthy();
    let store = Arc::new(MemoryStore::new());
    store.script_status("v1/Namespace", vec![json!({ "phase": "Active" })]);
    let fx = Fixture { store, ..fx };
    let mut cfg = config();
    cfg.schemas.clear();
    cfg.install_operators = false;
    run(cfg, fx.collaborators(), CancellationToken::new()).await.unwrap();

    assert_eq!(fx.store.count("probe policy/v1beta1"), 1);
    assert_eq!(fx.store.count("create policy/"), 0);
    assert_eq!(fx.store.count("create rbac.authorization.k8s.io"), 0);
    assert_eq!(fx.store.count("create networking.k8s.io/v1/NetworkPolicy chartmuseum"), 1);
}

#[tokio::test(start_paused = true)]
async fn workload_that_never_becomes_ready_fails_the_wait() {
    let fx = Fixture::healthy();
    fx.workloads.script("giantswarm", "chartmuseum-chartmuseum", vec![ready(0)]);
    let err = run(config(), fx.collaborators(), CancellationToken::new()).await.unwrap_err();
    assert_eq!(
        err,
        PipelineError::StepFailed {
            step: bootstrap::WAIT_FOR_WORKLOAD.into(),
            source: BootError::failed("waiting for 1 ready, current 0"),
        }
    );
    assert!(fx.workloads.polls() >= 29, "polls {}", fx.workloads.polls());
}

#[tokio::test(start_paused = true)]
async fn canceled_token_runs_no_step() {
    let fx = Fixture::healthy();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = run(config(), fx.collaborators(), cancel).await.unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(err.step(), Some(bootstrap::ENSURE_SCHEMAS));
    assert!(fx.store.calls().is_empty());
}
