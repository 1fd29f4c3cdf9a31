//! Device capability registry and kernel resolver.
//!
//! The registry is constructed explicitly, shared behind an `Arc`, and torn
//! down with [`DeviceRegistry::shutdown`]. It records each device's
//! threads-per-block limit and caches loaded modules and kernel handles per
//! device. Threads target a device through a [`DeviceContext`] obtained from
//! [`DeviceRegistry::bind`].
//!
//! Resolution takes a read lock on the kernel cache; on a miss the caller
//! serializes on a per-(module, device) slot, so concurrent first use of the
//! same key loads the module once and every caller gets the same handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info, trace, warn};
use lumen_common::{BackendKind, EngineConfig, KernelError, Result};

use super::DeviceId;
use crate::backend::{HostBackend, KernelArg, KernelBackend, KernelHandle, ModuleHandle};
use crate::catalog;
use crate::geometry::LaunchGeometry;
use crate::stream::Stream;

type KernelKey = (&'static str, &'static str);

struct DeviceDescriptor {
    id: DeviceId,
    max_threads_per_block: u32,
    /// One slot per module; holding the slot lock is what makes loads exactly-once.
    modules: Mutex<HashMap<&'static str, Arc<Mutex<Option<ModuleHandle>>>>>,
    kernels: RwLock<HashMap<KernelKey, KernelHandle>>,
    module_loads: AtomicU64,
}

impl DeviceDescriptor {
    fn new(id: DeviceId, max_threads_per_block: u32) -> Self {
        Self {
            id,
            max_threads_per_block,
            modules: Mutex::new(HashMap::new()),
            kernels: RwLock::new(HashMap::new()),
            module_loads: AtomicU64::new(0),
        }
    }

    fn cached(&self, key: &KernelKey) -> Option<KernelHandle> {
        self.kernels.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    fn module_slot(&self, module: &'static str) -> Arc<Mutex<Option<ModuleHandle>>> {
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(modules.entry(module).or_default())
    }

    fn clear(&self) {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.kernels.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Process-wide record of devices and their kernel caches.
pub struct DeviceRegistry {
    backend: Arc<dyn KernelBackend>,
    devices: Vec<DeviceDescriptor>,
    shut_down: AtomicBool,
}

impl DeviceRegistry {
    /// Discover the backend's devices and their limits.
    pub fn new(backend: impl KernelBackend + 'static) -> Result<Arc<Self>> {
        Self::with_backend(Arc::new(backend))
    }

    pub fn with_backend(backend: Arc<dyn KernelBackend>) -> Result<Arc<Self>> {
        let count = backend.device_count();
        let mut devices = Vec::with_capacity(count);
        for index in 0..count {
            let id = DeviceId(index);
            let max_threads = backend.max_threads_per_block(id)?;
            info!("{} device {id}: max {max_threads} threads per block", backend.name());
            devices.push(DeviceDescriptor::new(id, max_threads));
        }
        if devices.is_empty() {
            warn!("{} backend reports no devices", backend.name());
        }
        info!("device registry initialised with {count} {} devices", backend.name());
        Ok(Arc::new(Self { backend, devices, shut_down: AtomicBool::new(false) }))
    }

    /// Build the backend named by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        match config.backend {
            BackendKind::Host => {
                Self::new(HostBackend::new(config.host_devices, config.host_max_threads_per_block))
            }
            #[cfg(feature = "cuda")]
            BackendKind::Cuda => Self::new(crate::backend::CudaBackend::new()?),
            #[cfg(not(feature = "cuda"))]
            BackendKind::Cuda => Err(KernelError::DeviceUnavailable {
                device: config.default_device,
                reason: "built without the `cuda` feature".to_string(),
            }
            .into()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_live(&self, device: DeviceId) -> Result<()> {
        if self.is_shut_down() {
            return Err(KernelError::DeviceUnavailable {
                device: device.index(),
                reason: "device registry has been shut down".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn descriptor(&self, device: DeviceId) -> Result<&DeviceDescriptor> {
        self.ensure_live(device)?;
        self.devices.get(device.index()).ok_or_else(|| {
            KernelError::DeviceUnavailable {
                device: device.index(),
                reason: format!("{} devices registered", self.devices.len()),
            }
            .into()
        })
    }

    /// A context targeting device `index`, for use by one thread of execution.
    pub fn bind(self: &Arc<Self>, index: usize) -> Result<DeviceContext> {
        let device = DeviceId(index);
        self.descriptor(device)?;
        Ok(DeviceContext { registry: Arc::clone(self), device })
    }

    pub fn max_threads_per_block(&self, device: DeviceId) -> Result<u32> {
        Ok(self.descriptor(device)?.max_threads_per_block)
    }

    /// Resolve `(module, entry)` on `device`, loading the module on first use.
    pub fn kernel(&self, module: &str, entry: &str, device: DeviceId) -> Result<KernelHandle> {
        let descriptor = self.descriptor(device)?;
        let (module, entry) = catalog::entry(module, entry)?;
        let key = (module.name, entry.name);

        if let Some(kernel) = descriptor.cached(&key) {
            trace!("kernel cache hit: {}::{} on device {device}", key.0, key.1);
            return Ok(kernel);
        }

        let slot = descriptor.module_slot(module.name);
        let mut loaded = slot.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have finished while we waited for the slot.
        if let Some(kernel) = descriptor.cached(&key) {
            return Ok(kernel);
        }
        // Shutdown may have cleared the caches while we waited or loaded.
        self.ensure_live(device)?;
        let handle = match loaded.clone() {
            Some(handle) => handle,
            None => {
                let handle = self.backend.load_module(descriptor.id, module)?;
                descriptor.module_loads.fetch_add(1, Ordering::Relaxed);
                debug!("loaded module {} on device {device}", module.name);
                self.ensure_live(device)?;
                *loaded = Some(handle.clone());
                handle
            }
        };
        let kernel = self.backend.load_function(&handle, entry)?;
        debug!("resolved kernel {}::{} on device {device}", key.0, key.1);

        let mut kernels = descriptor.kernels.write().unwrap_or_else(PoisonError::into_inner);
        // `shutdown` raises the flag before taking this lock to clear it.
        self.ensure_live(device)?;
        Ok(kernels.entry(key).or_insert(kernel).clone())
    }

    /// Drop every cached module and kernel. Later resolutions fail with
    /// `DeviceUnavailable`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for device in &self.devices {
            device.clear();
        }
        info!("device registry shut down ({} devices released)", self.devices.len());
    }

    /// Number of module loads performed on `device`.
    pub fn module_loads(&self, device: DeviceId) -> u64 {
        self.devices.get(device.index()).map_or(0, |d| d.module_loads.load(Ordering::Relaxed))
    }

    /// Number of kernel handles cached for `device`.
    pub fn cached_kernels(&self, device: DeviceId) -> usize {
        self.devices
            .get(device.index())
            .map_or(0, |d| d.kernels.read().unwrap_or_else(PoisonError::into_inner).len())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("backend", &self.backend.name())
            .field("devices", &self.devices.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// The device a thread of execution currently targets.
///
/// Every device-side activation call takes a context, so "which device am I
/// on" is an explicit argument rather than thread-local state.
#[derive(Clone)]
pub struct DeviceContext {
    registry: Arc<DeviceRegistry>,
    device: DeviceId,
}

impl DeviceContext {
    /// Build a registry from `config` and bind its `default_device`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        DeviceRegistry::from_config(config)?.bind(config.default_device)
    }

    pub fn current_device(&self) -> DeviceId {
        self.device
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn max_threads_per_block(&self) -> Result<u32> {
        self.registry.max_threads_per_block(self.device)
    }

    pub fn kernel(&self, module: &str, entry: &str) -> Result<KernelHandle> {
        self.registry.kernel(module, entry, self.device)
    }

    pub fn create_stream(&self) -> Result<Stream> {
        self.registry.descriptor(self.device)?;
        self.registry.backend.create_stream(self.device)
    }

    /// Enqueue `kernel` on `stream`; returns without waiting.
    pub fn launch(
        &self,
        kernel: &KernelHandle,
        geometry: &LaunchGeometry,
        stream: &Stream,
        args: &mut [KernelArg<'_>],
    ) -> Result<()> {
        self.registry.descriptor(self.device)?;
        if stream.device() != self.device || kernel.device() != self.device {
            return Err(KernelError::launch(format!(
                "context for device {} given kernel on device {} and stream on device {}",
                self.device,
                kernel.device(),
                stream.device()
            ))
            .into());
        }
        for arg in args.iter() {
            let buffer_device = match arg {
                KernelArg::Data(data) => data.device(),
                KernelArg::Mask(mask) => mask.device(),
                KernelArg::Len(_) | KernelArg::Scalar(_) => continue,
            };
            if buffer_device != self.device {
                return Err(KernelError::launch(format!(
                    "buffer on device {buffer_device} passed to a launch on device {}",
                    self.device
                ))
                .into());
            }
        }
        debug!(
            "launch {}::{} on device {}: grid={:?} block={:?} shared={}",
            kernel.module(),
            kernel.name(),
            self.device,
            geometry.grid_dim(),
            geometry.block_dim(),
            geometry.shared_mem_bytes,
        );
        self.registry.backend.launch(kernel, geometry, stream, args)
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("backend", &self.registry.backend_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ACTIVATION;

    fn registry(devices: usize) -> Arc<DeviceRegistry> {
        DeviceRegistry::new(HostBackend::with_limits(vec![1024, 256, 64][..devices].to_vec())).unwrap()
    }

    #[test]
    fn test_discovers_devices_and_limits() {
        let reg = registry(3);
        assert_eq!(reg.device_count(), 3);
        assert_eq!(reg.max_threads_per_block(DeviceId(1)).unwrap(), 256);
        assert_eq!(reg.bind(2).unwrap().max_threads_per_block().unwrap(), 64);
    }

    #[test]
    fn test_bind_invalid_device() {
        let reg = registry(1);
        let err = reg.bind(1).unwrap_err();
        assert!(matches!(err.as_kernel(), Some(KernelError::DeviceUnavailable { device: 1, .. })));
    }

    #[test]
    fn test_second_resolution_is_a_cache_hit() {
        let reg = registry(1);
        let a = reg.kernel(ACTIVATION, "relu", DeviceId(0)).unwrap();
        let b = reg.kernel(ACTIVATION, "relu", DeviceId(0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.module_loads(DeviceId(0)), 1);
        assert_eq!(reg.cached_kernels(DeviceId(0)), 1);
    }

    #[test]
    fn test_entries_share_one_module_load_per_device() {
        let reg = registry(2);
        reg.kernel(ACTIVATION, "relu", DeviceId(0)).unwrap();
        reg.kernel(ACTIVATION, "multi_relu", DeviceId(0)).unwrap();
        reg.kernel(ACTIVATION, "relu", DeviceId(1)).unwrap();
        assert_eq!(reg.module_loads(DeviceId(0)), 1);
        assert_eq!(reg.module_loads(DeviceId(1)), 1);
        assert_eq!(reg.cached_kernels(DeviceId(0)), 2);
    }

    #[test]
    fn test_handles_are_per_device() {
        let reg = registry(2);
        let a = reg.kernel(ACTIVATION, "sigmoid", DeviceId(0)).unwrap();
        let b = reg.kernel(ACTIVATION, "sigmoid", DeviceId(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(b.device(), DeviceId(1));
    }

    #[test]
    fn test_unknown_entry_is_a_load_failure() {
        let reg = registry(1);
        let err = reg.kernel(ACTIVATION, "swish", DeviceId(0)).unwrap_err();
        assert!(matches!(err.as_kernel(), Some(KernelError::KernelLoadFailure { .. })));
        assert_eq!(reg.module_loads(DeviceId(0)), 0);
    }

    #[test]
    fn test_shutdown_releases_caches() {
        let reg = registry(1);
        let ctx = reg.bind(0).unwrap();
        ctx.kernel(ACTIVATION, "tanh_act").unwrap();
        reg.shutdown();
        assert!(reg.is_shut_down());
        assert_eq!(reg.cached_kernels(DeviceId(0)), 0);
        let err = ctx.kernel(ACTIVATION, "tanh_act").unwrap_err();
        assert!(matches!(err.as_kernel(), Some(KernelError::DeviceUnavailable { .. })));
        assert!(ctx.create_stream().is_err());
        // idempotent
        reg.shutdown();
    }

    #[test]
    fn test_launch_rejects_buffers_from_another_device() {
        let reg = registry(2);
        let ctx = reg.bind(0).unwrap();
        let stream = ctx.create_stream().unwrap();
        let other = reg.bind(1).unwrap().create_stream().unwrap();
        let plan = crate::geometry::plan_flat(2, 1024).unwrap().unwrap();

        let relu = ctx.kernel(ACTIVATION, "relu").unwrap();
        let mut foreign = other.upload(&[-1.0f32, 1.0]).unwrap();
        let err = ctx
            .launch(&relu, &plan, &stream, &mut [KernelArg::Data(&mut foreign), KernelArg::Len(2), KernelArg::Scalar(0.0)])
            .unwrap_err();
        assert!(matches!(err.as_kernel(), Some(KernelError::LaunchFailure { .. })));

        let masked = ctx.kernel(ACTIVATION, "relu_conditional").unwrap();
        let mut data = stream.upload(&[-1.0f32, 1.0]).unwrap();
        let mask = other.upload_mask(&[true, true]).unwrap();
        let err = ctx
            .launch(
                &masked,
                &plan,
                &stream,
                &mut [KernelArg::Data(&mut data), KernelArg::Mask(&mask), KernelArg::Len(2), KernelArg::Scalar(0.0)],
            )
            .unwrap_err();
        assert!(matches!(err.as_kernel(), Some(KernelError::LaunchFailure { .. })));
        assert_eq!(stream.launches(), 0);
        assert_eq!(stream.download(&data).unwrap(), vec![-1.0, 1.0]);
    }

    #[test]
    fn test_from_config_host() {
        let config = EngineConfig { host_devices: 2, host_max_threads_per_block: 128, ..Default::default() };
        let reg = DeviceRegistry::from_config(&config).unwrap();
        assert_eq!(reg.backend_name(), "host");
        assert_eq!(reg.device_count(), 2);
        assert_eq!(reg.max_threads_per_block(DeviceId(1)).unwrap(), 128);
    }

    #[test]
    fn test_context_from_config_binds_default_device() {
        let config = EngineConfig { host_devices: 3, default_device: 2, ..Default::default() };
        let ctx = DeviceContext::from_config(&config).unwrap();
        assert_eq!(ctx.current_device(), DeviceId(2));
        assert_eq!(ctx.registry().device_count(), 3);
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = EngineConfig { host_devices: 0, ..Default::default() };
        let err = DeviceRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, lumen_common::LumenError::Config(_)));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_from_config_cuda_without_feature() {
        let config = EngineConfig { backend: BackendKind::Cuda, ..Default::default() };
        let err = DeviceRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err.as_kernel(), Some(KernelError::DeviceUnavailable { .. })));
    }
}
