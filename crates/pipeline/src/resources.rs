//! Payloads of the cluster resources the bootstrap creates.

use platboot_core::{PipelineConfig, PriorityClassConfig, ResourceDescriptor};
use serde_json::json;

pub const NAMESPACE_KIND: &str = "v1/Namespace";
pub const PRIORITY_CLASS_KIND: &str = "scheduling.k8s.io/v1/PriorityClass";
pub const CATALOG_KIND: &str = "application.giantswarm.io/v1alpha1/AppCatalog";
pub const CLUSTER_ROLE_KIND: &str = "rbac.authorization.k8s.io/v1/ClusterRole";
pub const CLUSTER_ROLE_BINDING_KIND: &str = "rbac.authorization.k8s.io/v1/ClusterRoleBinding";
pub const POD_SECURITY_POLICY_KIND: &str = "policy/v1beta1/PodSecurityPolicy";
pub const NETWORK_POLICY_KIND: &str = "networking.k8s.io/v1/NetworkPolicy";

/// API group/version whose presence enables pod security policies.
pub const POD_SECURITY_API: (&str, &str) = ("policy", "v1beta1");

/// Label telling the app operator which catalog entries it owns.
const OPERATOR_VERSION_LABEL: &str = "app-operator.giantswarm.io/version";

pub fn namespace(name: &str) -> ResourceDescriptor { ResourceDescriptor::cluster(NAMESPACE_KIND, name, json!({})) }

pub fn priority_class(pc: &PriorityClassConfig) -> ResourceDescriptor {
    ResourceDescriptor::cluster(
        PRIORITY_CLASS_KIND,
        &pc.name,
        json!({ "value": pc.value, "globalDefault": false, "description": pc.description }),
    )
}

/// Catalog entry pointing the operators at a package repository.
pub fn catalog_entry(name: &str, storage_url: &str) -> ResourceDescriptor {
    ResourceDescriptor::cluster(
        CATALOG_KIND,
        name,
        json!({
            "metadata": { "labels": { OPERATOR_VERSION_LABEL: "0.0.0" } },
            "spec": {
                "title": name,
                "description": name,
                "storage": { "type": "helm", "URL": storage_url },
            },
        }),
    )
}

fn policy_name(cfg: &PipelineConfig) -> String { format!("{}-psp", cfg.workload.name) }

pub fn pod_security_policy(cfg: &PipelineConfig) -> ResourceDescriptor {
    ResourceDescriptor::cluster(
        POD_SECURITY_POLICY_KIND,
        policy_name(cfg),
        json!({
            "spec": {
                "allowPrivilegeEscalation": true,
                "volumes": ["*"],
                "runAsUser": { "rule": "RunAsAny" },
                "supplementalGroups": { "rule": "RunAsAny" },
                "fsGroup": { "rule": "RunAsAny" },
                "seLinux": { "rule": "RunAsAny" },
            },
        }),
    )
}

/// Role allowing use of the workload's pod security policy.
pub fn psp_cluster_role(cfg: &PipelineConfig) -> ResourceDescriptor {
    let name = policy_name(cfg);
    ResourceDescriptor::cluster(
        CLUSTER_ROLE_KIND,
        &name,
        json!({
            "rules": [{
                "apiGroups": ["extensions"],
                "resources": ["podsecuritypolicies"],
                "resourceNames": [name],
                "verbs": ["use"],
            }],
        }),
    )
}

pub fn psp_cluster_role_binding(cfg: &PipelineConfig) -> ResourceDescriptor {
    let name = policy_name(cfg);
    ResourceDescriptor::cluster(
        CLUSTER_ROLE_BINDING_KIND,
        &name,
        json!({
            "subjects": [{
                "kind": "ServiceAccount",
                "name": cfg.workload.service_account,
                "namespace": cfg.namespace,
            }],
            "roleRef": { "apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": name },
        }),
    )
}

/// Admit TCP ingress on the workload port only; deny all egress.
pub fn network_policy(cfg: &PipelineConfig) -> ResourceDescriptor {
    let w = &cfg.workload;
    ResourceDescriptor::namespaced(
        NETWORK_POLICY_KIND,
        &cfg.namespace,
        &w.name,
        json!({
            "spec": {
                "podSelector": { "matchLabels": { "app": w.name, "release": w.release_name } },
                "ingress": [{ "ports": [{ "protocol": "TCP", "port": w.port }] }],
                "egress": [],
                "policyTypes": ["Ingress", "Egress"],
            },
        }),
    )
}
