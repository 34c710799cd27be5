//! Platboot package: install a versioned package as a release, treating an
//! existing release as success and always cleaning up the downloaded artifact.

#![forbid(unsafe_code)]

mod helm;

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use platboot_core::{Artifact, BootError, BootResult, InstallOptions, InstallOutcome, PackageInstaller, PackageRef};
use platboot_retry::{retry_notify, Backoff};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Span};

pub use helm::{chart_url, classify_install_failure, parse_release_status, HelmInstaller};

/// Drives a [`PackageInstaller`] through resolve -> install -> cleanup.
pub struct PackageInstallerAdapter {
    installer: Arc<dyn PackageInstaller>,
    cancel: CancellationToken,
    span: Span,
    opts: InstallOptions,
}

impl PackageInstallerAdapter {
    pub fn new(installer: Arc<dyn PackageInstaller>, cancel: CancellationToken, span: Span) -> Self {
        Self { installer, cancel, span, opts: InstallOptions::default() }
    }

    pub fn with_options(mut self, opts: InstallOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Install `pkg` into `namespace`.
    ///
    /// Only artifact resolution is retried (per `backoff`). Install failures
    /// other than "already installed" are terminal. The resolved artifact is
    /// deleted on every exit path once it exists.
    pub async fn install(&self, pkg: &PackageRef, namespace: &str, mut backoff: Backoff) -> BootResult<InstallOutcome> {
        let t0 = Instant::now();
        let what = format!("{}@{}", pkg.name, pkg.version);
        debug!(parent: &self.span, package = %what, repo = %pkg.repository_url, "resolving artifact");
        let artifact = retry_notify(
            &mut backoff,
            &self.cancel,
            || self.installer.resolve_artifact(&pkg.name, &pkg.version, &pkg.repository_url),
            |e, wait| debug!(parent: &self.span, package = %what, error = %e, retry_in = ?wait, "artifact resolution failed"),
        )
        .await
        .map_err(|e| e.exhausted(&format!("resolving {}", what)))?;
        debug!(parent: &self.span, package = %what, path = %artifact.path.display(), "artifact resolved");

        info!(parent: &self.span, package = %what, release = %pkg.release_name, namespace, "installing");
        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BootError::Canceled),
            r = self.installer.install_from_artifact(&artifact, namespace, &pkg.release_name, &pkg.values, &self.opts) => r,
        };
        self.cleanup(&artifact).await;
        histogram!("package_install_ms", t0.elapsed().as_secs_f64() * 1000.0);

        match res {
            Ok(InstallOutcome::Installed) => {
                counter!("package_install_total", 1u64, "outcome" => "installed");
                info!(parent: &self.span, release = %pkg.release_name, "installed");
                Ok(InstallOutcome::Installed)
            }
            Ok(InstallOutcome::AlreadyInstalled) => {
                counter!("package_install_total", 1u64, "outcome" => "exists");
                info!(parent: &self.span, release = %pkg.release_name, "already installed");
                self.log_release_status(namespace, &pkg.release_name).await;
                Ok(InstallOutcome::AlreadyInstalled)
            }
            Err(BootError::Canceled) => Err(BootError::Canceled),
            Err(e) => {
                counter!("package_install_total", 1u64, "outcome" => "failed");
                Err(BootError::failed(format!("installing {} as release {:?}: {}", what, pkg.release_name, e)))
            }
        }
    }

    async fn cleanup(&self, artifact: &Artifact) {
        if let Err(e) = self.installer.delete_local_artifact(artifact).await {
            counter!("package_cleanup_failed_total", 1u64);
            error!(parent: &self.span, path = %artifact.path.display(), error = %e, "deletion of artifact failed");
        }
    }

    async fn log_release_status(&self, namespace: &str, release: &str) {
        match self.installer.release_status(namespace, release).await {
            Ok(Some(s)) => debug!(parent: &self.span, release, status = %s.status, version = ?s.version, "existing release"),
            Ok(None) => debug!(parent: &self.span, release, "existing release not reported by installer"),
            Err(e) => debug!(parent: &self.span, release, error = %e, "release status unavailable"),
        }
    }
}
