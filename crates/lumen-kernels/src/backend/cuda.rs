//! CUDA devices via cudarc 0.17.
//!
//! Catalog modules are NVRTC-compiled on first use per device. Launches go
//! through the cudarc launch builder on the caller's stream and are never
//! synchronized here.

use std::sync::Arc;

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{CudaContext, PushKernelArg};
use cudarc::nvrtc::compile_ptx;
use log::{debug, info};
use lumen_common::{KernelError, Result};

use super::{KernelArg, KernelBackend, KernelHandle, KernelInner, ModuleHandle, ModuleInner};
use crate::buffer::{Storage, foreign_buffer};
use crate::catalog::{KernelEntry, KernelModule};
use crate::device::DeviceId;
use crate::geometry::LaunchGeometry;
use crate::stream::{Stream, StreamInner};

pub struct CudaBackend {
    contexts: Vec<Arc<CudaContext>>,
}

impl CudaBackend {
    /// Open a context on every visible CUDA device.
    pub fn new() -> Result<Self> {
        let count = CudaContext::device_count().map_err(|e| KernelError::DeviceUnavailable {
            device: 0,
            reason: format!("failed to enumerate CUDA devices: {e:?}"),
        })?;
        let contexts = (0..count.max(0) as usize)
            .map(|ordinal| {
                CudaContext::new(ordinal).map_err(|e| {
                    KernelError::DeviceUnavailable {
                        device: ordinal,
                        reason: format!("failed to create CUDA context: {e:?}"),
                    }
                    .into()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        info!("CUDA backend initialised with {} devices", contexts.len());
        Ok(Self { contexts })
    }

    fn context(&self, device: DeviceId) -> Result<&Arc<CudaContext>> {
        self.contexts.get(device.index()).ok_or_else(|| {
            KernelError::DeviceUnavailable {
                device: device.index(),
                reason: format!("{} CUDA devices visible", self.contexts.len()),
            }
            .into()
        })
    }
}

impl KernelBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> usize {
        self.contexts.len()
    }

    fn max_threads_per_block(&self, device: DeviceId) -> Result<u32> {
        let threads = self
            .context(device)?
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
            .map_err(|e| KernelError::DeviceUnavailable {
                device: device.index(),
                reason: format!("failed to query max threads per block: {e:?}"),
            })?;
        Ok(threads.max(0) as u32)
    }

    fn create_stream(&self, device: DeviceId) -> Result<Stream> {
        let stream = self.context(device)?.new_stream().map_err(|e| KernelError::DeviceUnavailable {
            device: device.index(),
            reason: format!("failed to create stream: {e:?}"),
        })?;
        Ok(Stream::cuda(device, stream))
    }

    fn load_module(&self, device: DeviceId, module: &'static KernelModule) -> Result<ModuleHandle> {
        let ctx = self.context(device)?;
        let load_failure = |reason: String| KernelError::KernelLoadFailure {
            module: module.name.to_string(),
            entry: String::new(),
            reason,
        };
        debug!("cuda: compiling module {} for device {device}", module.name);
        let ptx = compile_ptx(module.source)
            .map_err(|e| load_failure(format!("NVRTC compilation failed: {e:?}")))?;
        let loaded = ctx
            .load_module(ptx)
            .map_err(|e| load_failure(format!("failed to load PTX module: {e:?}")))?;
        Ok(ModuleHandle::new(device, module, ModuleInner::Cuda(loaded)))
    }

    fn load_function(&self, module: &ModuleHandle, entry: &'static KernelEntry) -> Result<KernelHandle> {
        let load_failure = |reason: String| KernelError::KernelLoadFailure {
            module: module.name().to_string(),
            entry: entry.name.to_string(),
            reason,
        };
        let ModuleInner::Cuda(loaded) = module.inner() else {
            return Err(load_failure("module was loaded by another backend".to_string()).into());
        };
        let function = loaded
            .load_function(entry.name)
            .map_err(|e| load_failure(format!("function not found: {e:?}")))?;
        Ok(KernelHandle::new(module, entry, KernelInner::Cuda(function)))
    }

    fn launch(
        &self,
        kernel: &KernelHandle,
        geometry: &LaunchGeometry,
        stream: &Stream,
        args: &mut [KernelArg<'_>],
    ) -> Result<()> {
        let (KernelInner::Cuda(function), StreamInner::Cuda(cuda_stream)) = (kernel.inner(), stream.inner())
        else {
            return Err(foreign_buffer(self.name()));
        };
        if kernel.device() != stream.device() {
            return Err(KernelError::launch(format!(
                "kernel for device {} enqueued on a stream of device {}",
                kernel.device(),
                stream.device()
            ))
            .into());
        }

        let mut builder = cuda_stream.launch_builder(function);
        for arg in args.iter_mut() {
            match arg {
                KernelArg::Data(buffer) => match buffer.storage_mut() {
                    Storage::Cuda(slice) => {
                        builder.arg(slice);
                    }
                    Storage::Host(_) => return Err(foreign_buffer(self.name())),
                },
                KernelArg::Mask(buffer) => match buffer.storage() {
                    Storage::Cuda(slice) => {
                        builder.arg(slice);
                    }
                    Storage::Host(_) => return Err(foreign_buffer(self.name())),
                },
                KernelArg::Len(v) => {
                    builder.arg(&*v);
                }
                KernelArg::Scalar(v) => {
                    builder.arg(&*v);
                }
            }
        }

        // Safety: argument order and types follow the catalog entry's
        // signature, and the caller validated the region against the
        // buffer lengths before planning.
        unsafe { builder.launch(geometry.to_launch_config()) }
            .map_err(|e| KernelError::launch(format!("{} launch failed: {e:?}", kernel.name())))?;
        stream.record_launch();
        Ok(())
    }
}
