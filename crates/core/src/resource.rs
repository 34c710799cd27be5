use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{BootError, BootResult};

/// Declarative description of one resource to create.
///
/// `kind` is a GVK key: `v1/Namespace` for core kinds, `group/version/Kind` otherwise.
/// `spec` carries the remaining top-level fields of the object (`spec`, `rules`,
/// `value`, ...) and is opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub spec: Json,
}

impl ResourceDescriptor {
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>, spec: Json) -> Self {
        Self { kind: kind.into(), name: name.into(), namespace: None, spec }
    }

    pub fn namespaced(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>, spec: Json) -> Self {
        Self { kind: kind.into(), name: name.into(), namespace: Some(namespace.into()), spec }
    }

    /// Build a descriptor from a full manifest (e.g. a YAML document).
    pub fn from_manifest(mut manifest: Json) -> BootResult<Self> {
        let obj = manifest.as_object_mut().ok_or_else(|| BootError::invalid("manifest is not an object"))?;
        let api_version = obj
            .remove("apiVersion")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| BootError::invalid("manifest missing apiVersion"))?;
        let kind = obj
            .remove("kind")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| BootError::invalid("manifest missing kind"))?;
        let name = obj
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BootError::invalid("manifest missing metadata.name"))?;
        let namespace = obj
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(Self { kind: format!("{}/{}", api_version, kind), name, namespace, spec: manifest })
    }

    /// Identity of the resource: `(kind, namespace, name)`.
    pub fn key(&self) -> (String, Option<String>, String) {
        (self.kind.clone(), self.namespace.clone(), self.name.clone())
    }

    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.kind, ns, self.name),
            None => format!("{} {}", self.kind, self.name),
        }
    }

    /// Render the full object: apiVersion, kind and metadata merged over the payload.
    pub fn to_object(&self) -> BootResult<Json> {
        let (group, version, kind) = parse_gvk_key(&self.kind)?;
        let api_version = if group.is_empty() { version } else { format!("{}/{}", group, version) };
        let mut obj = match &self.spec {
            Json::Object(m) => m.clone(),
            Json::Null => serde_json::Map::new(),
            _ => return Err(BootError::invalid(format!("payload for {} is not an object", self.display_name()))),
        };
        obj.insert("apiVersion".into(), Json::String(api_version));
        obj.insert("kind".into(), Json::String(kind));
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if let Some(m) = meta.as_object_mut() {
            m.insert("name".into(), Json::String(self.name.clone()));
            match &self.namespace {
                Some(ns) => { m.insert("namespace".into(), Json::String(ns.clone())); }
                None => { m.remove("namespace"); }
            }
        }
        Ok(Json::Object(obj))
    }
}

/// Split a GVK key into `(group, version, kind)`; the group is empty for core kinds.
pub fn parse_gvk_key(key: &str) -> BootResult<(String, String, String)> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok((String::new(), (*version).to_string(), (*kind).to_string())),
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Ok(((*group).to_string(), (*version).to_string(), (*kind).to_string()))
        }
        _ => Err(BootError::invalid(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// A single patch operation addressed by a JSON pointer path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Remove { path: String },
    Replace { path: String, value: Json },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Remove { path } | PatchOp::Replace { path, .. } => path,
        }
    }
}

/// Render patch ops as one JSON merge patch. Removals become `null`, which the
/// server treats as "delete if present", so re-applying the patch is harmless.
pub fn merge_patch(ops: &[PatchOp]) -> BootResult<Json> {
    let mut root = Json::Object(serde_json::Map::new());
    for op in ops {
        let segments: Vec<String> = op
            .path()
            .strip_prefix('/')
            .ok_or_else(|| BootError::invalid(format!("patch path must start with '/': {}", op.path())))?
            .split('/')
            .map(|s| s.replace("~1", "/").replace("~0", "~"))
            .collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(BootError::invalid(format!("empty segment in patch path {}", op.path())));
        }
        let leaf = match op {
            PatchOp::Remove { .. } => Json::Null,
            PatchOp::Replace { value, .. } => value.clone(),
        };
        let mut cur = &mut root;
        let (last, parents) = segments.split_last().ok_or_else(|| BootError::invalid("empty patch path"))?;
        for seg in parents {
            let map = cur.as_object_mut().ok_or_else(|| BootError::invalid(format!("conflicting patch paths at {}", seg)))?;
            cur = map.entry(seg.clone()).or_insert_with(|| Json::Object(serde_json::Map::new()));
        }
        let map = cur.as_object_mut().ok_or_else(|| BootError::invalid(format!("conflicting patch paths at {}", last)))?;
        map.insert(last.clone(), leaf);
    }
    Ok(root)
}

/// Remote store of declarative resources.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn create(&self, desc: &ResourceDescriptor) -> BootResult<CreateOutcome>;
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> BootResult<Option<Json>>;
    async fn list(&self, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> BootResult<Vec<Json>>;
    async fn patch(&self, kind: &str, namespace: Option<&str>, name: &str, ops: &[PatchOp]) -> BootResult<()>;
    /// Whether the API serves `group/version`. The core group is addressed by `""`.
    async fn probe_capability(&self, group: &str, version: &str) -> BootResult<bool>;
}
