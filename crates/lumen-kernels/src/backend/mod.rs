//! Kernel backends.
//!
//! A [`KernelBackend`] owns the devices a [`crate::DeviceRegistry`] exposes:
//! it reports their limits, loads catalog modules onto them and enqueues
//! launches on their streams. The registry handles caching and
//! synchronization; backends are stateless beyond their device handles.

mod host;
pub use host::HostBackend;

#[cfg(feature = "cuda")]
mod cuda;
#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

use std::sync::Arc;

use lumen_common::Result;

use crate::buffer::DeviceBuffer;
use crate::catalog::{KernelEntry, KernelModule};
use crate::device::DeviceId;
use crate::geometry::LaunchGeometry;
use crate::stream::Stream;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaFunction, CudaModule};

/// Device-side half of the activation layer.
pub trait KernelBackend: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    fn device_count(&self) -> usize;

    fn max_threads_per_block(&self, device: DeviceId) -> Result<u32>;

    fn create_stream(&self, device: DeviceId) -> Result<Stream>;

    /// Compile and load `module` onto `device`. Called at most once per
    /// (module, device) by the registry.
    fn load_module(&self, device: DeviceId, module: &'static KernelModule) -> Result<ModuleHandle>;

    fn load_function(&self, module: &ModuleHandle, entry: &'static KernelEntry) -> Result<KernelHandle>;

    /// Enqueue `kernel` on `stream`. Must not wait for completion.
    fn launch(
        &self,
        kernel: &KernelHandle,
        geometry: &LaunchGeometry,
        stream: &Stream,
        args: &mut [KernelArg<'_>],
    ) -> Result<()>;
}

/// A kernel argument, in the order the entry declares its parameters.
#[derive(Debug)]
pub enum KernelArg<'a> {
    Data(&'a mut DeviceBuffer<f32>),
    Mask(&'a DeviceBuffer<u8>),
    /// Element counts, widths and byte pitches.
    Len(u64),
    Scalar(f32),
}

pub(crate) enum ModuleInner {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(Arc<CudaModule>),
}

/// A catalog module loaded on one device.
#[derive(Clone)]
pub struct ModuleHandle {
    device: DeviceId,
    module: &'static KernelModule,
    inner: Arc<ModuleInner>,
}

impl ModuleHandle {
    pub(crate) fn new(device: DeviceId, module: &'static KernelModule, inner: ModuleInner) -> Self {
        Self { device, module, inner: Arc::new(inner) }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn name(&self) -> &'static str {
        self.module.name
    }

    pub(crate) fn inner(&self) -> &ModuleInner {
        &self.inner
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("device", &self.device)
            .field("module", &self.module.name)
            .finish()
    }
}

pub(crate) enum KernelInner {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(CudaFunction),
}

/// A ready-to-launch kernel bound to `(module, entry, device)`.
///
/// Handles are cheap to clone. Two handles compare equal when they refer to
/// the same loaded function, so a cache hit returns a handle equal to the
/// one produced by the first load.
#[derive(Clone)]
pub struct KernelHandle {
    device: DeviceId,
    module: &'static str,
    entry: &'static KernelEntry,
    inner: Arc<KernelInner>,
}

impl KernelHandle {
    pub(crate) fn new(module: &ModuleHandle, entry: &'static KernelEntry, inner: KernelInner) -> Self {
        Self { device: module.device, module: module.name(), entry, inner: Arc::new(inner) }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn entry(&self) -> &'static KernelEntry {
        self.entry
    }

    pub fn name(&self) -> &'static str {
        self.entry.name
    }

    pub(crate) fn inner(&self) -> &KernelInner {
        &self.inner
    }
}

impl PartialEq for KernelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
            && self.module == other.module
            && self.entry == other.entry
            && Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for KernelHandle {}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KernelHandle({}::{} on device {})", self.module, self.entry.name, self.device)
    }
}
