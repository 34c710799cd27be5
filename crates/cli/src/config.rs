use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use platboot_core::{PipelineConfig, ResourceDescriptor};
use serde::Deserialize;

/// Read a pipeline config from YAML; missing keys keep their defaults.
pub fn load_file(path: &Path) -> Result<PipelineConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(PipelineConfig::default());
    }
    serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Split a `name=value` flag.
pub fn parse_kv(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("expected name=value, got {:?}", s)),
    }
}

/// Load every manifest from the `.yaml`/`.yml` files in `dir`, in file name
/// order. Files may hold several documents; empty documents are skipped.
pub fn load_schemas(dir: &Path) -> Result<Vec<ResourceDescriptor>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading schemas dir {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| matches!(p.extension().and_then(|x| x.to_str()), Some("yaml" | "yml")))
        .collect();
    files.sort();
    let mut out = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        for (idx, doc) in serde_yaml::Deserializer::from_str(&text).enumerate() {
            let value = serde_json::Value::deserialize(doc).with_context(|| format!("{} document {}", file.display(), idx))?;
            if value.is_null() {
                continue;
            }
            let desc = ResourceDescriptor::from_manifest(value)
                .map_err(|e| anyhow!("{} document {}: {}", file.display(), idx, e))?;
            out.push(desc);
        }
    }
    if out.is_empty() {
        bail!("no manifests found in {}", dir.display());
    }
    Ok(out)
}
