//! In-memory collaborators for tests. They record every call so tests can
//! assert on ordering and call counts.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value as Json;

use crate::{
    merge_patch, Artifact, BootError, BootResult, CreateOutcome, InstallOptions, InstallOutcome, PackageInstaller,
    PatchOp, ReleaseStatus, ResourceDescriptor, ResourceStore, ValuesTree, WorkloadStatus, WorkloadStatusSource,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

type Key = (String, Option<String>, String);

/// Resource store backed by a map. Objects get a `status` from the
/// per-kind script (if any) on every `get`, emulating a server that moves
/// resources through phases after creation.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, Json>>,
    create_failures: Mutex<VecDeque<BootError>>,
    status_script: Mutex<HashMap<String, VecDeque<Json>>>,
    capabilities: Mutex<BTreeSet<(String, String)>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// The next `n` creates fail with `err` before reaching the map.
    pub fn fail_next_creates(&self, n: usize, err: BootError) {
        let mut q = lock(&self.create_failures);
        for _ in 0..n { q.push_back(err.clone()); }
    }

    /// Successive `get`s of objects of `kind` report these statuses; the last one sticks.
    pub fn script_status(&self, kind: &str, statuses: Vec<Json>) {
        lock(&self.status_script).insert(kind.to_string(), statuses.into());
    }

    pub fn add_capability(&self, group: &str, version: &str) {
        lock(&self.capabilities).insert((group.to_string(), version.to_string()));
    }

    pub fn insert(&self, desc: &ResourceDescriptor) -> BootResult<()> {
        let obj = desc.to_object()?;
        lock(&self.objects).insert(desc.key(), obj);
        Ok(())
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Json> {
        lock(&self.objects).get(&(kind.to_string(), namespace.map(str::to_string), name.to_string())).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<(String, Option<String>, String), Json> { lock(&self.objects).clone() }

    pub fn len(&self) -> usize { lock(&self.objects).len() }
    pub fn is_empty(&self) -> bool { lock(&self.objects).is_empty() }

    /// Call log entries look like `create v1/Namespace apps`.
    pub fn calls(&self) -> Vec<String> { lock(&self.calls).clone() }

    pub fn count(&self, prefix: &str) -> usize { lock(&self.calls).iter().filter(|c| c.starts_with(prefix)).count() }

    fn record(&self, call: String) { lock(&self.calls).push(call); }
}

fn labels_match(obj: &Json, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        let (k, v) = term.split_once('=').unwrap_or((term, ""));
        let label = obj.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.get(k.trim()));
        match label.and_then(|l| l.as_str()) {
            Some(actual) => v.is_empty() || actual == v.trim(),
            None => false,
        }
    })
}

fn apply_merge(target: &mut Json, patch: &Json) {
    match (target, patch) {
        (Json::Object(t), Json::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    let slot = t.entry(k.clone()).or_insert(Json::Null);
                    if slot.is_object() && v.is_object() { apply_merge(slot, v); } else { *slot = v.clone(); }
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn create(&self, desc: &ResourceDescriptor) -> BootResult<CreateOutcome> {
        self.record(format!("create {} {}", desc.kind, desc.name));
        if let Some(err) = lock(&self.create_failures).pop_front() {
            return Err(err);
        }
        let obj = desc.to_object()?;
        let mut objects = lock(&self.objects);
        if objects.contains_key(&desc.key()) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        objects.insert(desc.key(), obj);
        Ok(CreateOutcome::Created)
    }

    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> BootResult<Option<Json>> {
        self.record(format!("get {} {}", kind, name));
        let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
        let mut objects = lock(&self.objects);
        let Some(obj) = objects.get_mut(&key) else { return Ok(None) };
        let mut script = lock(&self.status_script);
        if let Some(q) = script.get_mut(kind) {
            let next = if q.len() > 1 { q.pop_front() } else { q.front().cloned() };
            if let (Some(status), Some(map)) = (next, obj.as_object_mut()) {
                map.insert("status".into(), status);
            }
        }
        Ok(Some(obj.clone()))
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> BootResult<Vec<Json>> {
        self.record(format!("list {} {}", kind, label_selector.unwrap_or("")));
        let objects = lock(&self.objects);
        Ok(objects
            .iter()
            .filter(|((k, ns, _), _)| k == kind && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, o)| label_selector.map(|s| labels_match(o, s)).unwrap_or(true))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn patch(&self, kind: &str, namespace: Option<&str>, name: &str, ops: &[PatchOp]) -> BootResult<()> {
        self.record(format!("patch {} {}", kind, name));
        let patch = merge_patch(ops)?;
        let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
        let mut objects = lock(&self.objects);
        let obj = objects.get_mut(&key).ok_or_else(|| BootError::NotFound(format!("{} {}", kind, name)))?;
        apply_merge(obj, &patch);
        Ok(())
    }

    async fn probe_capability(&self, group: &str, version: &str) -> BootResult<bool> {
        self.record(format!("probe {}/{}", group, version));
        Ok(lock(&self.capabilities).contains(&(group.to_string(), version.to_string())))
    }
}

/// Package installer stub with per-release behavior.
#[derive(Default)]
pub struct StubInstaller {
    already_installed: Mutex<HashSet<String>>,
    install_errors: Mutex<HashMap<String, BootError>>,
    resolve_failures: Mutex<VecDeque<BootError>>,
    delete_error: Mutex<Option<BootError>>,
    releases: Mutex<BTreeMap<(String, String), ReleaseStatus>>,
    options: Mutex<HashMap<String, InstallOptions>>,
    calls: Mutex<Vec<String>>,
}

impl StubInstaller {
    pub fn new() -> Self { Self::default() }

    pub fn already_installed(&self, release: &str) {
        lock(&self.already_installed).insert(release.to_string());
    }

    pub fn fail_install(&self, release: &str, err: BootError) {
        lock(&self.install_errors).insert(release.to_string(), err);
    }

    pub fn fail_next_resolves(&self, n: usize, err: BootError) {
        let mut q = lock(&self.resolve_failures);
        for _ in 0..n { q.push_back(err.clone()); }
    }

    pub fn fail_delete(&self, err: BootError) { *lock(&self.delete_error) = Some(err); }

    /// Entries look like `resolve chart-operator@2.3.3`, `install chart-operator`, `delete /tmp/...`.
    pub fn calls(&self) -> Vec<String> { lock(&self.calls).clone() }

    pub fn count(&self, prefix: &str) -> usize { lock(&self.calls).iter().filter(|c| c.starts_with(prefix)).count() }

    pub fn installed_releases(&self) -> Vec<String> {
        lock(&self.releases).keys().map(|(_, r)| r.clone()).collect()
    }

    /// Options passed with the most recent install of `release`.
    pub fn install_options(&self, release: &str) -> Option<InstallOptions> {
        lock(&self.options).get(release).cloned()
    }

    fn record(&self, call: String) { lock(&self.calls).push(call); }
}

#[async_trait::async_trait]
impl PackageInstaller for StubInstaller {
    async fn resolve_artifact(&self, name: &str, version: &str, _repository_url: &str) -> BootResult<Artifact> {
        self.record(format!("resolve {}@{}", name, version));
        if let Some(err) = lock(&self.resolve_failures).pop_front() {
            return Err(err);
        }
        Ok(Artifact { path: PathBuf::from(format!("/tmp/{}-{}.tgz", name, version)) })
    }

    async fn install_from_artifact(
        &self,
        _artifact: &Artifact,
        namespace: &str,
        release_name: &str,
        _values: &ValuesTree,
        opts: &InstallOptions,
    ) -> BootResult<InstallOutcome> {
        self.record(format!("install {}", release_name));
        lock(&self.options).insert(release_name.to_string(), opts.clone());
        if let Some(err) = lock(&self.install_errors).get(release_name) {
            return Err(err.clone());
        }
        let key = (namespace.to_string(), release_name.to_string());
        let mut releases = lock(&self.releases);
        if lock(&self.already_installed).contains(release_name) || releases.contains_key(&key) {
            return Ok(InstallOutcome::AlreadyInstalled);
        }
        releases.insert(
            key,
            ReleaseStatus { name: release_name.to_string(), namespace: namespace.to_string(), status: "deployed".into(), version: Some(1) },
        );
        Ok(InstallOutcome::Installed)
    }

    async fn delete_local_artifact(&self, artifact: &Artifact) -> BootResult<()> {
        self.record(format!("delete {}", artifact.path.display()));
        match lock(&self.delete_error).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn release_status(&self, namespace: &str, release_name: &str) -> BootResult<Option<ReleaseStatus>> {
        self.record(format!("status {}", release_name));
        Ok(lock(&self.releases).get(&(namespace.to_string(), release_name.to_string())).cloned())
    }
}

/// Workload status source replaying a script per workload; the last status sticks.
#[derive(Default)]
pub struct ScriptedWorkloads {
    script: Mutex<HashMap<(String, String), VecDeque<WorkloadStatus>>>,
    polls: Mutex<usize>,
}

impl ScriptedWorkloads {
    pub fn new() -> Self { Self::default() }

    pub fn script(&self, namespace: &str, name: &str, statuses: Vec<WorkloadStatus>) {
        lock(&self.script).insert((namespace.to_string(), name.to_string()), statuses.into());
    }

    pub fn polls(&self) -> usize { *lock(&self.polls) }
}

#[async_trait::async_trait]
impl WorkloadStatusSource for ScriptedWorkloads {
    async fn get_workload(&self, namespace: &str, name: &str) -> BootResult<WorkloadStatus> {
        *lock(&self.polls) += 1;
        let mut script = lock(&self.script);
        let q = script
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| BootError::NotFound(format!("workload {}/{}", namespace, name)))?;
        let next = if q.len() > 1 { q.pop_front() } else { q.front().copied() };
        next.ok_or_else(|| BootError::NotFound(format!("workload {}/{}", namespace, name)))
    }
}
