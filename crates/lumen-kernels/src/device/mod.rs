//! Device identity, capability registry and per-thread device contexts.

mod registry;

pub use registry::{DeviceContext, DeviceRegistry};

/// Index of an accelerator known to a [`DeviceRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl DeviceId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for DeviceId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}
