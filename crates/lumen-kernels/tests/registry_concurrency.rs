//! Concurrency tests for the device registry's kernel cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use lumen_kernels::backend::{KernelArg, KernelBackend, KernelHandle, ModuleHandle};
use lumen_kernels::catalog::{KernelEntry, KernelModule};
use lumen_kernels::{
    Activation, DeviceId, DeviceRegistry, HostBackend, KernelError, LaunchGeometry, Result, Stream,
};

/// Host backend that counts module loads and makes each one slow, so
/// concurrent first resolutions overlap.
struct CountingBackend {
    inner: HostBackend,
    loads: AtomicUsize,
}

impl CountingBackend {
    fn new(devices: usize) -> Self {
        Self { inner: HostBackend::new(devices, 256), loads: AtomicUsize::new(0) }
    }
}

impl KernelBackend for CountingBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn device_count(&self) -> usize {
        self.inner.device_count()
    }

    fn max_threads_per_block(&self, device: DeviceId) -> Result<u32> {
        self.inner.max_threads_per_block(device)
    }

    fn create_stream(&self, device: DeviceId) -> Result<Stream> {
        self.inner.create_stream(device)
    }

    fn load_module(&self, device: DeviceId, module: &'static KernelModule) -> Result<ModuleHandle> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        self.inner.load_module(device, module)
    }

    fn load_function(&self, module: &ModuleHandle, entry: &'static KernelEntry) -> Result<KernelHandle> {
        self.inner.load_function(module, entry)
    }

    fn launch(
        &self,
        kernel: &KernelHandle,
        geometry: &LaunchGeometry,
        stream: &Stream,
        args: &mut [KernelArg<'_>],
    ) -> Result<()> {
        self.inner.launch(kernel, geometry, stream, args)
    }
}

#[test]
fn test_concurrent_first_resolution_loads_once() {
    let backend = Arc::new(CountingBackend::new(1));
    let registry = DeviceRegistry::with_backend(backend.clone()).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.kernel("activation", "leaky_relu", DeviceId(0)).unwrap()
            })
        })
        .collect();
    let kernels: Vec<KernelHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    assert_eq!(registry.module_loads(DeviceId(0)), 1);
    assert_eq!(kernels[0], kernels[1]);
    assert_eq!(registry.cached_kernels(DeviceId(0)), 1);
}

#[test]
fn test_many_threads_many_entries_one_load_per_device() {
    let backend = Arc::new(CountingBackend::new(2));
    let registry = DeviceRegistry::with_backend(backend.clone()).unwrap();
    let entries = ["relu", "multi_relu", "sigmoid", "softmax_conditional"];

    thread::scope(|scope| {
        for t in 0..8 {
            let registry = &registry;
            scope.spawn(move || {
                let ctx = registry.bind(t % 2).unwrap();
                for entry in entries {
                    ctx.kernel("activation", entry).unwrap();
                }
            });
        }
    });

    assert_eq!(backend.loads.load(Ordering::SeqCst), 2);
    for device in [DeviceId(0), DeviceId(1)] {
        assert_eq!(registry.module_loads(device), 1);
        assert_eq!(registry.cached_kernels(device), entries.len());
    }
}

#[test]
fn test_two_devices_driven_from_two_threads() {
    let registry = DeviceRegistry::new(HostBackend::with_limits(vec![4, 2])).unwrap();
    let leaky = Activation::leaky_relu_with(0.5);

    let outputs: Vec<Vec<f32>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|device| {
                let registry = &registry;
                scope.spawn(move || {
                    let ctx = registry.bind(device).unwrap();
                    assert_eq!(ctx.current_device(), DeviceId(device));
                    let stream = ctx.create_stream().unwrap();
                    let mut p = stream.upload_pitched(&[-2.0, 2.0, -4.0, 4.0], 2, 4, 0.0).unwrap();
                    leaky.compute_multi_gpu(&ctx, &mut p, 2, 2, &stream).unwrap();
                    stream.synchronize().unwrap();
                    stream.download(p.buffer()).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for out in outputs {
        assert_eq!(out, vec![-1.0, 2.0, 0.0, 0.0, -2.0, 4.0, 0.0, 0.0]);
    }
    assert_eq!(registry.module_loads(DeviceId(0)), 1);
    assert_eq!(registry.module_loads(DeviceId(1)), 1);
}

#[test]
fn test_context_rejects_stream_from_another_device() {
    let registry = DeviceRegistry::new(HostBackend::new(2, 1024)).unwrap();
    let ctx0 = registry.bind(0).unwrap();
    let ctx1 = registry.bind(1).unwrap();
    let stream1 = ctx1.create_stream().unwrap();
    let mut buf = stream1.upload(&[1.0f32, -1.0]).unwrap();

    let err = Activation::ReLU.compute_gpu(&ctx0, &mut buf, 2, &stream1).unwrap_err();
    assert!(matches!(err.as_kernel(), Some(KernelError::LaunchFailure { .. })));
    assert_eq!(stream1.launches(), 0);
}

#[test]
fn test_resolution_after_shutdown_is_unavailable() {
    let registry = DeviceRegistry::new(HostBackend::new(1, 1024)).unwrap();
    let ctx = registry.bind(0).unwrap();
    let stream = ctx.create_stream().unwrap();
    let mut buf = stream.upload(&[1.0f32]).unwrap();
    Activation::Tanh.compute_gpu(&ctx, &mut buf, 1, &stream).unwrap();

    registry.shutdown();
    let err = Activation::Tanh.compute_gpu(&ctx, &mut buf, 1, &stream).unwrap_err();
    assert!(matches!(err.as_kernel(), Some(KernelError::DeviceUnavailable { .. })));
    assert!(registry.bind(0).is_err());
}

#[test]
fn test_shutdown_during_module_load_discards_the_result() {
    let backend = Arc::new(CountingBackend::new(1));
    let registry = DeviceRegistry::with_backend(backend.clone()).unwrap();

    let resolver = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.kernel("activation", "relu", DeviceId(0)))
    };
    while backend.loads.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    registry.shutdown();

    let err = resolver.join().unwrap().unwrap_err();
    assert!(matches!(err.as_kernel(), Some(KernelError::DeviceUnavailable { device: 0, .. })));
    assert!(registry.is_shut_down());
    assert_eq!(registry.cached_kernels(DeviceId(0)), 0);
}

#[test]
fn test_invalid_device_and_unknown_module() {
    let registry = DeviceRegistry::new(HostBackend::new(1, 1024)).unwrap();
    let err = registry.kernel("activation", "relu", DeviceId(3)).unwrap_err();
    assert!(matches!(err.as_kernel(), Some(KernelError::DeviceUnavailable { device: 3, .. })));

    let err = registry.kernel("pooling", "max_pool", DeviceId(0)).unwrap_err();
    assert!(matches!(err.as_kernel(), Some(KernelError::KernelLoadFailure { .. })));
}
