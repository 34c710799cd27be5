use serde::{Deserialize, Serialize};

use crate::BootResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub desired_replicas: u32,
    pub ready_replicas: u32,
}

#[async_trait::async_trait]
pub trait WorkloadStatusSource: Send + Sync {
    /// `BootError::NotFound` when the workload does not exist (yet).
    async fn get_workload(&self, namespace: &str, name: &str) -> BootResult<WorkloadStatus>;
}
