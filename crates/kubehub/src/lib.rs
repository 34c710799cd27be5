//! Platboot kubehub: the cluster-facing collaborators, a dynamic resource
//! store and a deployment status source, on top of kube-rs.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Config,
};
use metrics::counter;
use platboot_core::{
    merge_patch, parse_gvk_key, BootError, BootResult, CreateOutcome, PatchOp, ResourceDescriptor, ResourceStore,
    WorkloadStatus, WorkloadStatusSource,
};
use serde_json::Value as Json;
use tracing::{debug, info};

/// Build a client from an explicit kubeconfig file, or the ambient
/// configuration (in-cluster, `KUBECONFIG`, `~/.kube/config`) when `None`.
pub async fn client_from(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default().await.context("loading default kube config");
    };
    let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("loading kubeconfig {}", path.display()))?;
    info!(kubeconfig = %path.display(), cluster = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

/// Resource store and workload status source backed by a live cluster.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn connect(kubeconfig: Option<&Path>) -> anyhow::Result<Self> {
        Ok(Self::new(client_from(kubeconfig).await?))
    }

    async fn find_api_resource(&self, kind_key: &str) -> BootResult<(ApiResource, bool)> {
        let (group, version, kind) = parse_gvk_key(kind_key)?;
        let gvk = GroupVersionKind { group, version, kind };
        let discovery = Discovery::new(self.client.clone())
            .filter(&[gvk.group.as_str()])
            .run()
            .await
            .map_err(|e| map_kube_error(kind_key, e))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    return Ok((ar, matches!(caps.scope, Scope::Namespaced)));
                }
            }
        }
        // A kind whose definition was just created is not served yet.
        Err(BootError::transient(format!("kind {} not served by the cluster", kind_key)))
    }

    async fn dynamic_api(&self, kind_key: &str, namespace: Option<&str>) -> BootResult<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(kind_key).await?;
        match (namespaced, namespace) {
            (true, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            (true, None) => Err(BootError::invalid(format!("namespace required for namespaced kind {}", kind_key))),
            (false, _) => Ok(Api::all_with(self.client.clone(), &ar)),
        }
    }
}

/// Classify a kube error into the shared taxonomy. Conflicts are handled by
/// the callers that expect them.
fn map_kube_error(what: &str, err: kube::Error) -> BootError {
    match &err {
        kube::Error::Api(resp) => classify_status(what, resp.code, &resp.message),
        kube::Error::HyperError(_) | kube::Error::Service(_) => BootError::transient(format!("{}: {}", what, err)),
        _ => BootError::failed(format!("{}: {}", what, err)),
    }
}

fn classify_status(what: &str, code: u16, message: &str) -> BootError {
    let msg = format!("{}: {} ({})", what, message, code);
    match code {
        404 => BootError::NotFound(msg),
        429 | 500..=599 => BootError::transient(msg),
        _ => BootError::failed(msg),
    }
}

fn is_conflict(err: &kube::Error) -> bool { matches!(err, kube::Error::Api(resp) if resp.code == 409) }

fn to_json(obj: DynamicObject) -> BootResult<Json> {
    serde_json::to_value(obj).map_err(|e| BootError::failed(format!("serializing object: {}", e)))
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn create(&self, desc: &ResourceDescriptor) -> BootResult<CreateOutcome> {
        let api = self.dynamic_api(&desc.kind, desc.namespace.as_deref()).await?;
        let obj: DynamicObject = serde_json::from_value(desc.to_object()?)
            .map_err(|e| BootError::invalid(format!("{}: {}", desc.display_name(), e)))?;
        counter!("kube_requests_total", 1u64, "verb" => "create");
        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => {
                debug!(resource = %desc.display_name(), "created");
                Ok(CreateOutcome::Created)
            }
            Err(e) if is_conflict(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(map_kube_error(&desc.display_name(), e)),
        }
    }

    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> BootResult<Option<Json>> {
        let api = self.dynamic_api(kind, namespace).await?;
        counter!("kube_requests_total", 1u64, "verb" => "get");
        match api.get_opt(name).await.map_err(|e| map_kube_error(name, e))? {
            Some(obj) => to_json(obj).map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> BootResult<Vec<Json>> {
        let api = match namespace {
            Some(_) => self.dynamic_api(kind, namespace).await?,
            None => {
                let (ar, _) = self.find_api_resource(kind).await?;
                Api::all_with(self.client.clone(), &ar)
            }
        };
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        counter!("kube_requests_total", 1u64, "verb" => "list");
        let items = api.list(&lp).await.map_err(|e| map_kube_error(kind, e))?;
        items.items.into_iter().map(to_json).collect()
    }

    async fn patch(&self, kind: &str, namespace: Option<&str>, name: &str, ops: &[PatchOp]) -> BootResult<()> {
        let api = self.dynamic_api(kind, namespace).await?;
        let body = merge_patch(ops)?;
        counter!("kube_requests_total", 1u64, "verb" => "patch");
        api.patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_kube_error(name, e))?;
        Ok(())
    }

    async fn probe_capability(&self, group: &str, version: &str) -> BootResult<bool> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[group])
            .run()
            .await
            .map_err(|e| map_kube_error(&format!("discovering {}/{}", group, version), e))?;
        let served = discovery.groups().any(|g| g.name() == group && g.versions().any(|v| v == version));
        debug!(group, version, served, "api capability probed");
        Ok(served)
    }
}

#[async_trait]
impl WorkloadStatusSource for KubeStore {
    async fn get_workload(&self, namespace: &str, name: &str) -> BootResult<WorkloadStatus> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        counter!("kube_requests_total", 1u64, "verb" => "get");
        let deploy = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(name, e))?
            .ok_or_else(|| BootError::NotFound(format!("deployment {}/{}", namespace, name)))?;
        Ok(deployment_status(&deploy))
    }
}

fn deployment_status(d: &Deployment) -> WorkloadStatus {
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    WorkloadStatus { desired_replicas: desired.max(0) as u32, ready_replicas: ready.max(0) as u32 }
}
