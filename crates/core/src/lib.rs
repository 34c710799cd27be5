//! Platboot core: shared types, error taxonomy and the collaborator traits the
//! provisioning pipeline is written against.

#![forbid(unsafe_code)]

mod config;
mod error;
pub mod mock;
mod package;
mod resource;
mod values;
mod workload;

pub use config::{PipelineConfig, PriorityClassConfig, ReadinessConfig, WorkloadConfig};
pub use error::{BootError, BootResult};
pub use package::{Artifact, InstallOptions, InstallOutcome, PackageInstaller, PackageRef, ReleaseStatus};
pub use resource::{merge_patch, parse_gvk_key, CreateOutcome, PatchOp, ResourceDescriptor, ResourceStore};
pub use values::{Value, ValuesTree};
pub use workload::{WorkloadRef, WorkloadStatus, WorkloadStatusSource};

pub mod prelude {
    pub use super::{
        BootError, BootResult, CreateOutcome, InstallOutcome, PackageInstaller, PackageRef, PatchOp, PipelineConfig,
        ResourceDescriptor, ResourceStore, ValuesTree, WorkloadRef, WorkloadStatus, WorkloadStatusSource,
    };
}
