//! Validated key/value tree for package values.
//!
//! Payloads are checked when they enter the system (YAML text, JSON, or
//! deserialized config) so a malformed document fails as `InvalidConfig`
//! before any installer runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;

use crate::{BootError, BootResult};

const MAX_DEPTH: usize = 32;
const MAX_NODES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self { Value::Int(n) }
}

/// Root of a values document; always a map.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValuesTree {
    root: BTreeMap<String, Value>,
}

impl ValuesTree {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.root.is_empty() }

    pub fn from_yaml(text: &str) -> BootResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let doc: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| BootError::invalid(format!("values: parsing YAML: {}", e)))?;
        let mut budget = Budget::default();
        match convert_yaml(&doc, "", 0, &mut budget)? {
            Value::Map(root) => Ok(Self { root }),
            Value::Null => Ok(Self::default()),
            _ => Err(BootError::invalid("values: document root must be a map")),
        }
    }

    pub fn from_json(doc: &Json) -> BootResult<Self> {
        let mut budget = Budget::default();
        match convert_json(doc, "", 0, &mut budget)? {
            Value::Map(root) => Ok(Self { root }),
            Value::Null => Ok(Self::default()),
            _ => Err(BootError::invalid("values: document root must be a map")),
        }
    }

    /// Set a value at a dotted path (`env.open.DISABLE_API`), creating maps on the way.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> BootResult<()> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(BootError::invalid(format!("values: invalid path {:?}", path)));
        }
        let (last, parents) = segments.split_last().ok_or_else(|| BootError::invalid("values: empty path"))?;
        let mut cur = &mut self.root;
        for seg in parents {
            let slot = cur.entry((*seg).to_string()).or_insert_with(|| Value::Map(BTreeMap::new()));
            cur = match slot {
                Value::Map(m) => m,
                _ => return Err(BootError::invalid(format!("values: {:?} is not a map in path {:?}", seg, path))),
            };
        }
        cur.insert((*last).to_string(), value.into());
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut cur = self.root.get(segments.next()?)?;
        for seg in segments {
            cur = match cur {
                Value::Map(m) => m.get(seg)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }

    pub fn to_yaml(&self) -> BootResult<String> {
        serde_yaml::to_string(self).map_err(|e| BootError::failed(format!("values: rendering YAML: {}", e)))
    }
}

impl From<BTreeMap<String, Value>> for ValuesTree {
    fn from(root: BTreeMap<String, Value>) -> Self { Self { root } }
}

impl<'de> Deserialize<'de> for ValuesTree {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let doc = Json::deserialize(d)?;
        ValuesTree::from_json(&doc).map_err(serde::de::Error::custom)
    }
}

#[derive(Default)]
struct Budget {
    nodes: usize,
}

impl Budget {
    fn take(&mut self, path: &str, depth: usize) -> BootResult<()> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(BootError::invalid(format!("values: document too large (>{} nodes)", MAX_NODES)));
        }
        if depth > MAX_DEPTH {
            return Err(BootError::invalid(format!("values: nesting too deep at {:?} (>{} levels)", path, MAX_DEPTH)));
        }
        Ok(())
    }
}

fn child(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_string() } else { format!("{}.{}", path, key) }
}

fn check_key(path: &str, key: &str) -> BootResult<()> {
    if key.is_empty() {
        return Err(BootError::invalid(format!("values: empty key under {:?}", path)));
    }
    Ok(())
}

fn convert_yaml(v: &serde_yaml::Value, path: &str, depth: usize, budget: &mut Budget) -> BootResult<Value> {
    use serde_yaml::Value as Y;
    budget.take(path, depth)?;
    Ok(match v {
        Y::Null => Value::Null,
        Y::Bool(b) => Value::Bool(*b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() => Value::Float(f),
                    _ => return Err(BootError::invalid(format!("values: non-finite number at {:?}", path))),
                }
            }
        }
        Y::String(s) => Value::String(s.clone()),
        Y::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(convert_yaml(item, &format!("{}[{}]", path, i), depth + 1, budget)?);
            }
            Value::List(out)
        }
        Y::Mapping(map) => {
            let mut out = BTreeMap::new();
            for (k, vv) in map.iter() {
                let key = k
                    .as_str()
                    .ok_or_else(|| BootError::invalid(format!("values: non-string key under {:?}", path)))?;
                check_key(path, key)?;
                let p = child(path, key);
                out.insert(key.to_string(), convert_yaml(vv, &p, depth + 1, budget)?);
            }
            Value::Map(out)
        }
        Y::Tagged(_) => return Err(BootError::invalid(format!("values: tagged value not supported at {:?}", path))),
    })
}

fn convert_json(v: &Json, path: &str, depth: usize, budget: &mut Budget) -> BootResult<Value> {
    budget.take(path, depth)?;
    Ok(match v {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().ok_or_else(|| BootError::invalid(format!("values: bad number at {:?}", path)))?),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(convert_json(item, &format!("{}[{}]", path, i), depth + 1, budget)?);
            }
            Value::List(out)
        }
        Json::Object(map) => {
            let mut out = BTreeMap::new();
            for (k, vv) in map.iter() {
                check_key(path, k)?;
                let p = child(path, k);
                out.insert(k.clone(), convert_json(vv, &p, depth + 1, budget)?);
            }
            Value::Map(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_yaml() {
        let t = ValuesTree::from_yaml(
            "persistence:\n  enabled: \"true\"\nenv:\n  open:\n    DISABLE_API: false\nprobes:\n  readiness:\n    initialDelaySeconds: 10\n",
        )
        .unwrap();
        assert_eq!(t.get("persistence.enabled"), Some(&Value::String("true".into())));
        assert_eq!(t.get("env.open.DISABLE_API"), Some(&Value::Bool(false)));
        assert_eq!(t.get("probes.readiness.initialDelaySeconds"), Some(&Value::Int(10)));
        assert_eq!(t.get("probes.missing"), None);
    }

    #[test]
    fn rejects_malformed_documents() {
        let e = ValuesTree::from_yaml("- a\n- b\n").unwrap_err();
        assert!(e.to_string().contains("root must be a map"), "e={}", e);
        let e = ValuesTree::from_yaml("1: x\n").unwrap_err();
        assert!(e.to_string().contains("non-string key"), "e={}", e);
        let e = ValuesTree::from_yaml("a:\n  \"\": 1\n").unwrap_err();
        assert!(e.to_string().contains("empty key"), "e={}", e);
        let e = ValuesTree::from_yaml("a: .nan\n").unwrap_err();
        assert!(e.to_string().contains("non-finite"), "e={}", e);
        assert!(matches!(ValuesTree::from_yaml("a: [").unwrap_err(), BootError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_overly_deep_documents() {
        let mut doc = serde_json::json!(1);
        for _ in 0..(MAX_DEPTH + 2) {
            doc = serde_json::json!({ "k": doc });
        }
        let e = ValuesTree::from_json(&doc).unwrap_err();
        assert!(e.to_string().contains("too deep"), "e={}", e);
    }

    #[test]
    fn set_creates_maps_and_refuses_scalars_in_path() {
        let mut t = ValuesTree::new();
        t.set("serviceAccount.name", "workload").unwrap();
        t.set("serviceAccount.create", true).unwrap();
        assert_eq!(t.to_json(), serde_json::json!({ "serviceAccount": { "name": "workload", "create": true } }));
        assert!(t.set("serviceAccount.name.x", "y").is_err());
        assert!(t.set("a..b", "y").is_err());
    }

    #[test]
    fn deserialize_validates() {
        let ok: ValuesTree = serde_json::from_str(r#"{"a": {"b": [1, "x", null]}}"#).unwrap();
        assert_eq!(ok.to_json()["a"]["b"][1], "x");
        assert!(serde_json::from_str::<ValuesTree>(r#"[1, 2]"#).is_err());
        assert!(serde_json::from_str::<ValuesTree>(r#"{"": 1}"#).is_err());
    }

    #[test]
    fn yaml_rendering_keeps_structure() {
        let t = ValuesTree::from_yaml("a:\n  b: 1\n").unwrap();
        let again = ValuesTree::from_yaml(&t.to_yaml().unwrap()).unwrap();
        assert_eq!(t, again);
    }
}
