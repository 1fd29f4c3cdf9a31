//! Execution streams.
//!
//! A [`Stream`] is an ordered queue of device work on one device. Launches
//! are enqueued and return immediately; nothing in the activation layer waits
//! on a stream. Callers synchronize before reading results.

use std::sync::atomic::{AtomicU64, Ordering};

use lumen_common::{KernelError, Result};

use crate::buffer::{DeviceBuffer, DeviceElement, PitchedBuffer, Storage};
use crate::device::DeviceId;
use crate::mask;

#[cfg(feature = "cuda")]
use crate::buffer::foreign_buffer;
#[cfg(feature = "cuda")]
use cudarc::driver::CudaStream;
#[cfg(feature = "cuda")]
use std::sync::Arc;

pub(crate) enum StreamInner {
    /// Host emulation runs each launch at enqueue time.
    Host,
    #[cfg(feature = "cuda")]
    Cuda(Arc<CudaStream>),
}

pub struct Stream {
    device: DeviceId,
    inner: StreamInner,
    launches: AtomicU64,
}

impl Stream {
    pub(crate) fn host(device: DeviceId) -> Self {
        Self { device, inner: StreamInner::Host, launches: AtomicU64::new(0) }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn cuda(device: DeviceId, stream: Arc<CudaStream>) -> Self {
        Self { device, inner: StreamInner::Cuda(stream), launches: AtomicU64::new(0) }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn kind(&self) -> &'static str {
        match &self.inner {
            StreamInner::Host => "host",
            #[cfg(feature = "cuda")]
            StreamInner::Cuda(_) => "cuda",
        }
    }

    /// Number of kernels enqueued on this stream so far.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub(crate) fn record_launch(&self) {
        self.launches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inner(&self) -> &StreamInner {
        &self.inner
    }

    /// Copy `data` into a new allocation on this stream's device.
    pub fn upload<T: DeviceElement>(&self, data: &[T]) -> Result<DeviceBuffer<T>> {
        match &self.inner {
            StreamInner::Host => Ok(DeviceBuffer::from_host(self.device, data.to_vec())),
            #[cfg(feature = "cuda")]
            StreamInner::Cuda(stream) => {
                let slice = stream.memcpy_stod(data).map_err(|e| {
                    KernelError::launch(format!("failed to copy {} elements to device: {e:?}", data.len()))
                })?;
                Ok(DeviceBuffer::from_cuda(self.device, slice))
            }
        }
    }

    /// Allocate `len` zeroed elements.
    pub fn alloc_zeros<T: DeviceElement>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        match &self.inner {
            StreamInner::Host => Ok(DeviceBuffer::from_host(self.device, vec![T::default(); len])),
            #[cfg(feature = "cuda")]
            StreamInner::Cuda(stream) => {
                let slice = stream.alloc_zeros::<T>(len).map_err(|e| {
                    KernelError::launch(format!("failed to allocate {len} elements: {e:?}"))
                })?;
                Ok(DeviceBuffer::from_cuda(self.device, slice))
            }
        }
    }

    /// Upload a host mask; `true` is encoded as `1`.
    pub fn upload_mask(&self, mask: &[bool]) -> Result<DeviceBuffer<u8>> {
        self.upload(&mask::encode(mask))
    }

    /// Upload `data` (dense rows of `width`) as a pitched allocation, filling
    /// the `pitch - width` trailing elements of each row with `padding`.
    pub fn upload_pitched(
        &self,
        data: &[f32],
        width: usize,
        pitch: usize,
        padding: f32,
    ) -> Result<PitchedBuffer> {
        if width == 0 || pitch < width || data.len() % width != 0 {
            return Err(KernelError::invalid_shape(format!(
                "cannot lay out {} elements as rows of width {width} at pitch {pitch}",
                data.len()
            ))
            .into());
        }
        let mut padded = Vec::with_capacity(data.len() / width * pitch);
        for row in data.chunks(width) {
            padded.extend_from_slice(row);
            padded.resize(padded.len() + pitch - width, padding);
        }
        PitchedBuffer::new(self.upload(&padded)?, pitch)
    }

    /// Copy a buffer back to the host. Waits for work queued before it.
    pub fn download<T: DeviceElement>(&self, buffer: &DeviceBuffer<T>) -> Result<Vec<T>> {
        match (&self.inner, buffer.storage()) {
            (StreamInner::Host, Storage::Host(data)) => Ok(data.clone()),
            #[cfg(feature = "cuda")]
            (StreamInner::Cuda(stream), Storage::Cuda(slice)) => stream
                .memcpy_dtov(slice)
                .map_err(|e| KernelError::launch(format!("failed to copy from device: {e:?}")).into()),
            #[cfg(feature = "cuda")]
            _ => Err(foreign_buffer(self.kind())),
        }
    }

    /// Block until all enqueued work has completed.
    pub fn synchronize(&self) -> Result<()> {
        match &self.inner {
            StreamInner::Host => Ok(()),
            #[cfg(feature = "cuda")]
            StreamInner::Cuda(stream) => stream
                .synchronize()
                .map_err(|e| KernelError::launch(format!("stream synchronize failed: {e:?}")).into()),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device)
            .field("kind", &self.kind())
            .field("launches", &self.launches())
            .finish()
    }
}
