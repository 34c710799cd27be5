//! The canonical bootstrap: schemas, priority class, namespace, operators,
//! catalog entries, access policies, then the package-serving workload.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use platboot_apply::{PostCondition, ResourceEnsurer};
use platboot_core::{
    BootResult, PackageInstaller, PackageRef, PipelineConfig, ResourceStore, WorkloadRef, WorkloadStatusSource,
};
use platboot_ops::{dns_reset_ops, instance_selector, DeploymentPatcher, ReadinessPoller};
use platboot_package::PackageInstallerAdapter;
use platboot_retry::{retry_notify, Backoff};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Span};

use crate::engine::{Step, StepContext};
use crate::resources;

pub const ENSURE_SCHEMAS: &str = "ensure-schemas";
pub const ENSURE_PRIORITY_CLASS: &str = "ensure-priority-class";
pub const ENSURE_NAMESPACE: &str = "ensure-namespace";
pub const INSTALL_OPERATORS: &str = "install-operators";
pub const PATCH_OPERATOR_DEPLOYMENT: &str = "patch-operator-deployment";
pub const INSTALL_REPOSITORY_ENTRIES: &str = "install-repository-entries";
pub const ENSURE_ACCESS_POLICIES: &str = "ensure-access-policies";
pub const INSTALL_WORKLOAD: &str = "install-workload";
pub const WAIT_FOR_WORKLOAD: &str = "wait-for-workload";

/// The cluster-facing collaborators a bootstrap run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ResourceStore>,
    pub installer: Arc<dyn PackageInstaller>,
    pub workloads: Arc<dyn WorkloadStatusSource>,
}

/// Context shared by every bootstrap step.
pub struct Bootstrap {
    config: PipelineConfig,
    collab: Collaborators,
    cancel: CancellationToken,
    span: Span,
}

impl Bootstrap {
    pub fn new(config: PipelineConfig, collab: Collaborators, cancel: CancellationToken, span: Span) -> Self {
        Self { config, collab, cancel, span }
    }

    pub fn config(&self) -> &PipelineConfig { &self.config }

    fn ensurer(&self) -> ResourceEnsurer {
        ResourceEnsurer::new(self.collab.store.clone(), self.cancel.clone(), self.span.clone())
    }

    fn packages(&self) -> PackageInstallerAdapter {
        PackageInstallerAdapter::new(self.collab.installer.clone(), self.cancel.clone(), self.span.clone())
    }
}

impl StepContext for Bootstrap {
    fn validate(&self) -> BootResult<()> { self.config.validate() }
    fn is_canceled(&self) -> bool { self.cancel.is_cancelled() }
}

/// Steps in their fixed order.
pub fn steps() -> Vec<Step<Bootstrap>> {
    vec![
        Step::new(ENSURE_SCHEMAS, ensure_schemas),
        Step::new(ENSURE_PRIORITY_CLASS, ensure_priority_class),
        Step::new(ENSURE_NAMESPACE, ensure_namespace),
        Step::new(INSTALL_OPERATORS, install_operators).skip_when(|b| !b.config.install_operators),
        Step::new(PATCH_OPERATOR_DEPLOYMENT, patch_operator_deployment)
            .skip_when(|b| !b.config.install_operators || b.config.dns_patch_operator.is_none()),
        Step::new(INSTALL_REPOSITORY_ENTRIES, install_repository_entries),
        Step::new(ENSURE_ACCESS_POLICIES, ensure_access_policies),
        Step::new(INSTALL_WORKLOAD, install_workload),
        Step::new(WAIT_FOR_WORKLOAD, wait_for_workload).skip_when(|b| !b.config.wait_for_readiness),
    ]
}

fn schema_backoff() -> Backoff { Backoff::max_retries(7, Duration::from_secs(1)) }

fn ensure_schemas(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        debug!(parent: &b.span, count = b.config.schemas.len(), "ensuring schemas");
        b.ensurer().ensure_all(&b.config.schemas, &PostCondition::condition("Established"), schema_backoff).await
    })
}

fn ensure_priority_class(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        let pc = resources::priority_class(&b.config.priority_class);
        b.ensurer().ensure(&pc, &PostCondition::None, Backoff::short()).await.map(drop)
    })
}

fn ensure_namespace(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        let ns = resources::namespace(&b.config.namespace);
        b.ensurer().ensure(&ns, &PostCondition::phase("Active"), Backoff::short()).await.map(drop)
    })
}

fn install_operators(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        let packages = b.packages();
        for (name, version) in &b.config.operator_versions {
            let pkg = PackageRef {
                name: name.clone(),
                version: version.clone(),
                repository_url: b.config.operator_repository_url.clone(),
                release_name: name.clone(),
                values: b.config.operator_values.clone(),
            };
            let outcome = packages.install(&pkg, &b.config.namespace, Backoff::short()).await?;
            info!(parent: &b.span, operator = %name, version = %version, ?outcome, "operator ensured");
        }
        Ok(())
    })
}

fn patch_operator_deployment(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        let Some(operator) = b.config.dns_patch_operator.as_deref() else { return Ok(()) };
        let patcher = DeploymentPatcher::new(b.collab.store.clone(), b.cancel.clone(), b.span.clone());
        patcher
            .patch_single_deployment(&b.config.namespace, &instance_selector(operator), &dns_reset_ops(), Backoff::short())
            .await
            .map(drop)
    })
}

fn install_repository_entries(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        let entries: Vec<_> =
            b.config.repository_entries.iter().map(|(name, url)| resources::catalog_entry(name, url)).collect();
        b.ensurer().ensure_all(&entries, &PostCondition::None, Backoff::short).await
    })
}

fn ensure_access_policies(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        let (group, version) = resources::POD_SECURITY_API;
        let store = &b.collab.store;
        let psp_served = retry_notify(
            &mut Backoff::short(),
            &b.cancel,
            || store.probe_capability(group, version),
            |e, wait| debug!(parent: &b.span, error = %e, retry_in = ?wait, "capability probe failed"),
        )
        .await
        .map_err(|e| e.exhausted(&format!("probing {}/{}", group, version)))?;

        let mut descs = Vec::new();
        if psp_served {
            descs.push(resources::pod_security_policy(&b.config));
            descs.push(resources::psp_cluster_role(&b.config));
            descs.push(resources::psp_cluster_role_binding(&b.config));
        } else {
            info!(parent: &b.span, api = %format!("{}/{}", group, version), "pod security policies not served; skipping");
        }
        descs.push(resources::network_policy(&b.config));
        b.ensurer().ensure_all(&descs, &PostCondition::None, Backoff::short).await
    })
}

fn install_workload(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        let w = &b.config.workload;
        let pkg = PackageRef {
            name: w.name.clone(),
            version: w.version.clone(),
            repository_url: w.repository_url.clone(),
            release_name: w.release_name.clone(),
            values: w.values.clone(),
        };
        b.packages()
            .with_options(w.install_options())
            .install(&pkg, &b.config.namespace, Backoff::medium())
            .await
            .map(drop)
    })
}

fn wait_for_workload(b: &Bootstrap) -> BoxFuture<'_, BootResult<()>> {
    Box::pin(async move {
        let r = &b.config.readiness;
        let workload = WorkloadRef::new(b.config.namespace.clone(), b.config.workload.deployment.clone());
        let poller = ReadinessPoller::new(b.collab.workloads.clone(), b.cancel.clone(), b.span.clone());
        poller
            .wait_until_ready(
                &workload,
                r.target_replicas,
                Duration::from_secs(r.interval_secs),
                Duration::from_secs(r.timeout_secs),
                |e, wait| info!(parent: &b.span, %workload, reason = %e, retry_in = ?wait, "workload not ready yet"),
            )
            .await
    })
}
