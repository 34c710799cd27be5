use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use platboot_core::{Artifact, BootError, BootResult, InstallOptions, InstallOutcome, PackageInstaller, ReleaseStatus, ValuesTree};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use url::Url;

const HELM_BIN_ENV: &str = "PLATBOOT_HELM_BIN";

/// Package installer backed by chart repositories and the `helm` binary.
pub struct HelmInstaller {
    http: reqwest::Client,
    helm_bin: PathBuf,
    kubeconfig: Option<PathBuf>,
    work_dir: PathBuf,
}

impl HelmInstaller {
    pub fn new(kubeconfig: Option<PathBuf>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("building http client")?;
        let helm_bin = std::env::var_os(HELM_BIN_ENV).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("helm"));
        Ok(Self { http, helm_bin, kubeconfig, work_dir: std::env::temp_dir() })
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    fn helm(&self) -> Command {
        let mut cmd = Command::new(&self.helm_bin);
        if let Some(kc) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kc);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn fetch(&self, url: &Url) -> BootResult<reqwest::Response> {
        let resp = self.http.get(url.clone()).send().await.map_err(|e| http_error(url, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let msg = format!("GET {}: {}", url, status);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(BootError::transient(msg))
        } else {
            Err(BootError::failed(msg))
        }
    }

    async fn run(&self, mut cmd: Command, what: &str) -> BootResult<Output> {
        cmd.output().await.map_err(|e| BootError::failed(format!("{}: spawning {}: {}", what, self.helm_bin.display(), e)))
    }
}

fn http_error(url: &Url, e: reqwest::Error) -> BootError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        BootError::transient(format!("GET {}: {}", url, e))
    } else {
        BootError::failed(format!("GET {}: {}", url, e))
    }
}

fn repo_base(repository_url: &str) -> anyhow::Result<Url> {
    let mut base = Url::parse(repository_url).with_context(|| format!("parsing repository url {:?}", repository_url))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

#[derive(Debug, Deserialize)]
struct RepoIndex {
    #[serde(default)]
    entries: std::collections::BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    version: String,
    #[serde(default)]
    urls: Vec<String>,
}

/// Locate the download URL of `name@version` in a repository `index.yaml`.
/// Relative chart URLs are resolved against the repository URL.
pub fn chart_url(index_yaml: &str, repository_url: &str, name: &str, version: &str) -> anyhow::Result<Url> {
    let index: RepoIndex = serde_yaml::from_str(index_yaml).context("parsing repository index")?;
    let versions = index.entries.get(name).ok_or_else(|| anyhow!("chart {:?} not in repository index", name))?;
    let entry = versions
        .iter()
        .find(|e| e.version == version || e.version.strip_prefix('v') == Some(version))
        .ok_or_else(|| anyhow!("chart {:?} has no version {:?}", name, version))?;
    let raw = entry.urls.first().ok_or_else(|| anyhow!("chart {}@{} has no download urls", name, version))?;
    let base = repo_base(repository_url)?;
    base.join(raw).with_context(|| format!("resolving chart url {:?}", raw))
}

/// Map a failed `helm install` to an outcome: a release whose name is already
/// taken is success, everything else an execution failure. Conflicts on the
/// release's resources ("rendered manifests contain a resource that already
/// exists") mean nothing was installed and stay failures.
pub fn classify_install_failure(stderr: &str) -> BootResult<InstallOutcome> {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("cannot re-use a name that is still in use") || release_name_taken(&lower) {
        return Ok(InstallOutcome::AlreadyInstalled);
    }
    Err(BootError::failed(stderr.trim().to_string()))
}

fn release_name_taken(lower: &str) -> bool {
    if lower.contains("release: already exists") {
        return true;
    }
    lower
        .find("release named ")
        .map(|at| lower[at..].lines().next().unwrap_or_default().contains("already exists"))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct StatusDoc {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    info: Option<StatusInfo>,
}

#[derive(Debug, Deserialize)]
struct StatusInfo {
    #[serde(default)]
    status: String,
}

/// Parse `helm status -o json` output.
pub fn parse_release_status(json: &str) -> anyhow::Result<ReleaseStatus> {
    let doc: StatusDoc = serde_json::from_str(json).context("parsing release status")?;
    Ok(ReleaseStatus {
        name: doc.name,
        namespace: doc.namespace,
        status: doc.info.map(|i| i.status).unwrap_or_default(),
        version: doc.version,
    })
}

fn install_args(
    release_name: &str,
    chart: &Path,
    namespace: &str,
    values_file: Option<&Path>,
    opts: &InstallOptions,
) -> Vec<OsString> {
    let mut args: Vec<OsString> =
        vec!["install".into(), release_name.into(), chart.into(), "--namespace".into(), namespace.into()];
    if let Some(f) = values_file {
        args.push("--values".into());
        args.push(f.into());
    }
    if opts.wait {
        args.push("--wait".into());
        if let Some(t) = opts.timeout {
            args.push("--timeout".into());
            args.push(format!("{}s", t.as_secs()).into());
        }
    }
    args
}

fn stderr_of(out: &Output) -> String { String::from_utf8_lossy(&out.stderr).into_owned() }

async fn write_values(dir: &Path, values: &ValuesTree) -> BootResult<Option<PathBuf>> {
    if values.is_empty() {
        return Ok(None);
    }
    let yaml = values.to_yaml()?;
    let path = dir.join(format!("values-{}.yaml", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, yaml)
        .await
        .map_err(|e| BootError::failed(format!("writing values file {}: {}", path.display(), e)))?;
    Ok(Some(path))
}

/// Removes a partially written file on drop unless disarmed.
struct PartialFile<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(self.path) {
                debug!(path = %self.path.display(), error = %e, "removing partial artifact failed");
            }
        }
    }
}

/// Write the downloaded chart. A failed or canceled write leaves no file behind.
async fn write_artifact(path: &Path, bytes: &[u8]) -> BootResult<()> {
    let mut guard = PartialFile { path, armed: true };
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| BootError::failed(format!("writing {}: {}", path.display(), e)))?;
    guard.armed = false;
    Ok(())
}

#[async_trait]
impl PackageInstaller for HelmInstaller {
    async fn resolve_artifact(&self, name: &str, version: &str, repository_url: &str) -> BootResult<Artifact> {
        let base = repo_base(repository_url).map_err(|e| BootError::invalid(format!("{:#}", e)))?;
        let index_url = base.join("index.yaml").map_err(|e| BootError::invalid(e.to_string()))?;
        let index = self
            .fetch(&index_url)
            .await?
            .text()
            .await
            .map_err(|e| http_error(&index_url, e))?;
        let url = chart_url(&index, repository_url, name, version).map_err(|e| BootError::failed(format!("{:#}", e)))?;
        debug!(chart = name, version, %url, "downloading chart");
        let bytes = self.fetch(&url).await?.bytes().await.map_err(|e| http_error(&url, e))?;
        let path = self.work_dir.join(format!("{}-{}.tgz", name, uuid::Uuid::new_v4()));
        write_artifact(&path, &bytes).await?;
        Ok(Artifact { path })
    }

    async fn install_from_artifact(
        &self,
        artifact: &Artifact,
        namespace: &str,
        release_name: &str,
        values: &ValuesTree,
        opts: &InstallOptions,
    ) -> BootResult<InstallOutcome> {
        let values_file = write_values(&self.work_dir, values).await?;
        let mut cmd = self.helm();
        cmd.args(install_args(release_name, &artifact.path, namespace, values_file.as_deref(), opts));
        let out = self.run(cmd, "helm install").await;
        if let Some(f) = values_file {
            if let Err(e) = tokio::fs::remove_file(&f).await {
                debug!(path = %f.display(), error = %e, "removing values file failed");
            }
        }
        let out = out?;
        if out.status.success() {
            return Ok(InstallOutcome::Installed);
        }
        classify_install_failure(&stderr_of(&out))
    }

    async fn delete_local_artifact(&self, artifact: &Artifact) -> BootResult<()> {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BootError::failed(format!("deleting {}: {}", artifact.path.display(), e))),
        }
    }

    async fn release_status(&self, namespace: &str, release_name: &str) -> BootResult<Option<ReleaseStatus>> {
        let mut cmd = self.helm();
        cmd.args(["status", release_name, "--namespace", namespace, "--output", "json"]);
        let out = self.run(cmd, "helm status").await?;
        if !out.status.success() {
            let stderr = stderr_of(&out);
            if stderr.contains("not found") {
                return Ok(None);
            }
            return Err(BootError::failed(stderr.trim().to_string()));
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        parse_release_status(&stdout).map(Some).map_err(|e| BootError::failed(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
apiVersion: v1
entries:
  chart-operator:
    - version: 2.3.3
      urls:
        - chart-operator-2.3.3.tgz
    - version: 2.3.2
      urls:
        - https://mirror.example.io/charts/chart-operator-2.3.2.tgz
  app-operator:
    - version: v2.3.2
      urls: []
"#;

    #[test]
    fn relative_chart_urls_resolve_against_repository() {
        let u = chart_url(INDEX, "https://giantswarm.github.io/control-plane-catalog", "chart-operator", "2.3.3").unwrap();
        assert_eq!(u.as_str(), "https://giantswarm.github.io/control-plane-catalog/chart-operator-2.3.3.tgz");
    }

    #[test]
    fn absolute_chart_urls_are_kept() {
        let u = chart_url(INDEX, "https://giantswarm.github.io/control-plane-catalog/", "chart-operator", "2.3.2").unwrap();
        assert_eq!(u.as_str(), "https://mirror.example.io/charts/chart-operator-2.3.2.tgz");
    }

    #[test]
    fn missing_chart_version_or_urls_error() {
        let repo = "https://charts.example.io/";
        assert!(chart_url(INDEX, repo, "nope", "1.0.0").unwrap_err().to_string().contains("not in repository index"));
        assert!(chart_url(INDEX, repo, "chart-operator", "9.9.9").unwrap_err().to_string().contains("no version"));
        assert!(chart_url(INDEX, repo, "app-operator", "2.3.2").unwrap_err().to_string().contains("no download urls"));
    }

    #[test]
    fn existing_release_is_classified_as_installed() {
        let stderr = "Error: INSTALLATION FAILED: cannot re-use a name that is still in use\n";
        assert_eq!(classify_install_failure(stderr), Ok(InstallOutcome::AlreadyInstalled));
        assert_eq!(classify_install_failure("Error: release: already exists"), Ok(InstallOutcome::AlreadyInstalled));
        assert_eq!(
            classify_install_failure("Error: a release named chart-operator already exists.\nRun: helm ls --all chart-operator"),
            Ok(InstallOutcome::AlreadyInstalled)
        );
        assert_eq!(
            classify_install_failure("Error: chart requires kubeVersion >= 1.20\n"),
            Err(BootError::failed("Error: chart requires kubeVersion >= 1.20"))
        );
    }

    #[test]
    fn conflicting_release_resources_are_a_failure() {
        let stderr = "Error: INSTALLATION FAILED: rendered manifests contain a resource that already exists. \
                      Unable to continue with install: ClusterRole \"chart-operator\" in namespace \"\" exists and \
                      cannot be imported into the current release\n";
        let err = classify_install_failure(stderr).unwrap_err();
        assert!(matches!(err, BootError::ExecutionFailed(ref m) if m.contains("rendered manifests")), "err={:?}", err);
    }

    #[test]
    fn install_args_follow_options() {
        let chart = Path::new("/tmp/chartmuseum-1.tgz");
        let plain = install_args("chartmuseum", chart, "giantswarm", None, &InstallOptions::default());
        assert_eq!(plain, ["install", "chartmuseum", "/tmp/chartmuseum-1.tgz", "--namespace", "giantswarm"].map(OsString::from));

        let opts = InstallOptions { wait: true, timeout: Some(std::time::Duration::from_secs(600)) };
        let waiting = install_args("chartmuseum", chart, "giantswarm", Some(Path::new("/tmp/values.yaml")), &opts);
        assert_eq!(
            &waiting[5..],
            &["--values", "/tmp/values.yaml", "--wait", "--timeout", "600s"].map(OsString::from)[..]
        );
    }

    #[test]
    fn parses_status_json() {
        let s = parse_release_status(r#"{"name":"chart-operator","namespace":"giantswarm","version":2,"info":{"status":"deployed"}}"#).unwrap();
        assert_eq!(s.name, "chart-operator");
        assert_eq!(s.version, Some(2));
        assert!(s.is_deployed());
    }

    #[tokio::test]
    async fn delete_removes_file_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chart.tgz");
        std::fs::write(&path, b"x").unwrap();
        let helm = HelmInstaller::new(None).unwrap().with_work_dir(dir.path());
        let artifact = Artifact { path: path.clone() };
        helm.delete_local_artifact(&artifact).await.unwrap();
        assert!(!path.exists());
        helm.delete_local_artifact(&artifact).await.unwrap();
    }

    #[tokio::test]
    async fn artifact_write_keeps_complete_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chart-operator-1.tgz");
        write_artifact(&path, b"chart").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"chart");

        let partial = dir.path().join("app-operator-2.tgz");
        std::fs::write(&partial, b"cha").unwrap();
        drop(PartialFile { path: &partial, armed: true });
        assert!(!partial.exists());

        let missing_dir = dir.path().join("gone").join("chart.tgz");
        assert!(write_artifact(&missing_dir, b"chart").await.is_err());
        assert!(!missing_dir.exists());
    }

    #[tokio::test]
    async fn values_file_only_written_when_values_present() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(write_values(dir.path(), &ValuesTree::new()).await.unwrap(), None);
        let mut v = ValuesTree::new();
        v.set("image.tag", "stable").unwrap();
        let path = write_values(dir.path(), &v).await.unwrap().unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("tag: stable"), "{}", body);
    }
}
