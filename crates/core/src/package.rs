use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BootResult, ValuesTree};

/// A versioned package to install as a named release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
    pub repository_url: String,
    pub release_name: String,
    #[serde(default)]
    pub values: ValuesTree,
}

/// Locally materialized package archive. Owned by the install call that resolved it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOptions {
    /// Ask the installer to block until the release's resources are ready.
    pub wait: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallOutcome {
    Installed,
    /// Release already exists or its name cannot be reused.
    AlreadyInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStatus {
    pub name: String,
    pub namespace: String,
    /// Installer-reported state, e.g. `deployed`, `failed`, `pending-install`.
    pub status: String,
    pub version: Option<u32>,
}

impl ReleaseStatus {
    pub fn is_deployed(&self) -> bool { self.status.eq_ignore_ascii_case("deployed") }
}

/// Resolves packages to artifacts and installs them as releases.
#[async_trait::async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn resolve_artifact(&self, name: &str, version: &str, repository_url: &str) -> BootResult<Artifact>;
    async fn install_from_artifact(
        &self,
        artifact: &Artifact,
        namespace: &str,
        release_name: &str,
        values: &ValuesTree,
        opts: &InstallOptions,
    ) -> BootResult<InstallOutcome>;
    /// Failures here are reported by callers, never escalated.
    async fn delete_local_artifact(&self, artifact: &Artifact) -> BootResult<()>;
    async fn release_status(&self, namespace: &str, release_name: &str) -> BootResult<Option<ReleaseStatus>>;
}
