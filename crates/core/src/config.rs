//! Pipeline configuration. Everything the bootstrap needs to know about
//! versions, URLs and names is supplied here rather than compiled into steps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{BootError, BootResult, InstallOptions, ResourceDescriptor, Value, ValuesTree};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub install_operators: bool,
    pub wait_for_readiness: bool,
    /// Operator package name -> version.
    pub operator_versions: BTreeMap<String, String>,
    /// Repository index entry name -> storage URL.
    pub repository_entries: BTreeMap<String, String>,

    /// Namespace receiving operators, catalog entries and the workload.
    pub namespace: String,
    pub operator_repository_url: String,
    #[serde(skip_serializing_if = "ValuesTree::is_empty")]
    pub operator_values: ValuesTree,
    /// Operator whose deployment gets its DNS settings reset after install.
    pub dns_patch_operator: Option<String>,
    pub priority_class: PriorityClassConfig,
    pub workload: WorkloadConfig,
    pub readiness: ReadinessConfig,
    /// Schema definitions (full manifests) ensured before anything else.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<ResourceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityClassConfig {
    pub name: String,
    pub value: i32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    pub name: String,
    pub version: String,
    pub repository_url: String,
    pub release_name: String,
    /// Deployment created by the release; this is what readiness polls.
    pub deployment: String,
    pub service_account: String,
    pub port: u16,
    pub values: ValuesTree,
    /// Have the installer block until the release's resources are ready, up
    /// to this many seconds. Unset installs without waiting.
    pub install_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Replica target; the deployment's own desired count when unset.
    pub target_replicas: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut operator_versions = BTreeMap::new();
        operator_versions.insert("app-operator".to_string(), "2.3.2".to_string());
        operator_versions.insert("chart-operator".to_string(), "2.3.3".to_string());
        let mut repository_entries = BTreeMap::new();
        repository_entries.insert("chartmuseum".to_string(), "http://chartmuseum-chartmuseum:8080/charts/".to_string());
        Self {
            install_operators: true,
            wait_for_readiness: true,
            operator_versions,
            repository_entries,
            namespace: "giantswarm".to_string(),
            operator_repository_url: "https://giantswarm.github.io/control-plane-catalog/".to_string(),
            operator_values: ValuesTree::default(),
            dns_patch_operator: Some("chart-operator".to_string()),
            priority_class: PriorityClassConfig::default(),
            workload: WorkloadConfig::default(),
            readiness: ReadinessConfig::default(),
            schemas: Vec::new(),
        }
    }
}

impl Default for PriorityClassConfig {
    fn default() -> Self {
        Self {
            name: "giantswarm-critical".to_string(),
            value: 1_000_000_000,
            description: "This priority class is used by platform components.".to_string(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        let values = ValuesTree::from(entries([
            ("persistence", Value::Map(entries([("enabled", "true".into())]))),
            ("serviceAccount", Value::Map(entries([("name", "chartmuseum".into()), ("create", "true".into())]))),
            (
                "env",
                Value::Map(entries([(
                    "open",
                    Value::Map(entries([("ALLOW_OVERWRITE", true.into()), ("DISABLE_API", false.into())])),
                )])),
            ),
            (
                "probes",
                Value::Map(entries([("readiness", Value::Map(entries([("initialDelaySeconds", 10i64.into())])))])),
            ),
        ]));
        Self {
            name: "chartmuseum".to_string(),
            version: "2.13.3".to_string(),
            repository_url: "https://charts.helm.sh/stable/".to_string(),
            release_name: "chartmuseum".to_string(),
            deployment: "chartmuseum-chartmuseum".to_string(),
            service_account: "chartmuseum".to_string(),
            port: 8080,
            values,
            install_timeout_secs: None,
        }
    }
}

fn entries<const N: usize>(pairs: [(&str, Value); N]) -> BTreeMap<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

impl WorkloadConfig {
    pub fn install_options(&self) -> InstallOptions {
        match self.install_timeout_secs {
            Some(secs) => InstallOptions { wait: true, timeout: Some(std::time::Duration::from_secs(secs)) },
            None => InstallOptions::default(),
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self { Self { interval_secs: 10, timeout_secs: 300, target_replicas: None } }
}

impl PipelineConfig {
    /// Check for missing or contradictory settings. Runs before any step.
    pub fn validate(&self) -> BootResult<()> {
        non_empty("namespace", &self.namespace)?;
        if self.install_operators {
            if self.operator_versions.is_empty() {
                return Err(BootError::invalid("install_operators is set but operator_versions is empty"));
            }
            for (name, version) in &self.operator_versions {
                non_empty("operator name", name)?;
                non_empty(&format!("operator_versions[{}]", name), version)?;
            }
            check_url("operator_repository_url", &self.operator_repository_url)?;
            if let Some(op) = &self.dns_patch_operator {
                if !self.operator_versions.contains_key(op) {
                    return Err(BootError::invalid(format!("dns_patch_operator {:?} is not among operator_versions", op)));
                }
            }
        }
        for (name, url) in &self.repository_entries {
            non_empty("repository entry name", name)?;
            check_url(&format!("repository_entries[{}]", name), url)?;
        }
        non_empty("priority_class.name", &self.priority_class.name)?;

        let w = &self.workload;
        non_empty("workload.name", &w.name)?;
        non_empty("workload.version", &w.version)?;
        non_empty("workload.release_name", &w.release_name)?;
        non_empty("workload.service_account", &w.service_account)?;
        check_url("workload.repository_url", &w.repository_url)?;
        if w.port == 0 {
            return Err(BootError::invalid("workload.port must not be 0"));
        }
        if w.install_timeout_secs == Some(0) {
            return Err(BootError::invalid("workload.install_timeout_secs must be > 0"));
        }

        if self.wait_for_readiness {
            non_empty("workload.deployment", &w.deployment)?;
            let r = &self.readiness;
            if r.interval_secs == 0 {
                return Err(BootError::invalid("readiness.interval_secs must be > 0"));
            }
            if r.timeout_secs < r.interval_secs {
                return Err(BootError::invalid(format!(
                    "readiness.timeout_secs ({}) is shorter than readiness.interval_secs ({})",
                    r.timeout_secs, r.interval_secs
                )));
            }
            if r.target_replicas == Some(0) {
                return Err(BootError::invalid("readiness.target_replicas must be > 0"));
            }
        }
        for s in &self.schemas {
            crate::parse_gvk_key(&s.kind)?;
            non_empty("schema name", &s.name)?;
        }
        Ok(())
    }
}

fn non_empty(field: &str, v: &str) -> BootResult<()> {
    if v.trim().is_empty() {
        return Err(BootError::invalid(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn check_url(field: &str, v: &str) -> BootResult<()> {
    let u = url::Url::parse(v).map_err(|e| BootError::invalid(format!("{}: invalid URL {:?}: {}", field, v, e)))?;
    match u.scheme() {
        "http" | "https" => Ok(()),
        other => Err(BootError::invalid(format!("{}: unsupported scheme {:?}", field, other))),
    }
}
