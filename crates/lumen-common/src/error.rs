//! Error types shared by the lumen crates.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type used across lumen.
pub type Result<T> = std::result::Result<T, LumenError>;

/// Top-level error.
#[derive(Debug, Error)]
pub enum LumenError {
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by device resolution, launch planning and activation dispatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    /// The device index is out of range, or the registry has been shut down.
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: usize, reason: String },

    /// A kernel module or entry point is missing or failed to compile/load.
    #[error("failed to load kernel {module}::{entry}: {reason}")]
    KernelLoadFailure { module: String, entry: String, reason: String },

    /// The activation (or buffer kind) does not implement the requested operation.
    #[error("{activation} does not support {operation}")]
    UnsupportedOperation { activation: String, operation: String },

    /// Sizes, strides or pitches that cannot describe a valid workload.
    #[error("invalid workload shape: {reason}")]
    InvalidWorkloadShape { reason: String },

    /// The backend rejected a launch or a host/device transfer.
    #[error("launch failed: {reason}")]
    LaunchFailure { reason: String },
}

impl KernelError {
    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::InvalidWorkloadShape { reason: reason.into() }
    }

    pub fn unsupported(activation: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation { activation: activation.into(), operation: operation.into() }
    }

    pub fn launch(reason: impl Into<String>) -> Self {
        Self::LaunchFailure { reason: reason.into() }
    }

    /// True for [`KernelError::UnsupportedOperation`].
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }
}

impl LumenError {
    /// The wrapped kernel error, if this is one.
    pub fn as_kernel(&self) -> Option<&KernelError> {
        match self {
            Self::Kernel(e) => Some(e),
            Self::Config(_) => None,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        self.as_kernel().is_some_and(KernelError::is_unsupported)
    }
}
