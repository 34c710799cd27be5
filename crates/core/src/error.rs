use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every collaborator and component.
///
/// "Already exists" and "already installed" are not errors; they surface as
/// [`crate::CreateOutcome::AlreadyExists`] and [`crate::InstallOutcome::AlreadyInstalled`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BootError {
    /// Network blips, rate limiting, API not yet serving a freshly created kind.
    #[error("transient store error: {0}")]
    TransientStore(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{what} in phase {observed:?}, expected {expected:?}")]
    PhaseNotReady { what: String, expected: String, observed: String },
    #[error("waiting for {desired} ready, current {ready}")]
    ReplicasNotReady { desired: u32, ready: u32 },
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("canceled")]
    Canceled,
}

impl BootError {
    pub fn transient(msg: impl Into<String>) -> Self { Self::TransientStore(msg.into()) }
    pub fn failed(msg: impl Into<String>) -> Self { Self::ExecutionFailed(msg.into()) }
    pub fn invalid(msg: impl Into<String>) -> Self { Self::InvalidConfig(msg.into()) }

    /// Whether a retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStore(_) | Self::NotFound(_) | Self::PhaseNotReady { .. } | Self::ReplicasNotReady { .. }
        )
    }

    pub fn is_canceled(&self) -> bool { matches!(self, Self::Canceled) }

    /// Terminal form of an error after a retry budget ran out.
    ///
    /// Already-terminal errors pass through unchanged so `Canceled` and
    /// `InvalidConfig` keep their identity.
    pub fn exhausted(self, context: &str) -> Self {
        match self {
            e @ (Self::ExecutionFailed(_) | Self::InvalidConfig(_) | Self::Canceled) => e,
            e => Self::ExecutionFailed(format!("{}: {}", context, e)),
        }
    }
}

pub type BootResult<T> = Result<T, BootError>;
