//! Device-resident buffers.
//!
//! A [`DeviceBuffer`] is tagged with the device that owns it and with the
//! backend that allocated it. The orchestration layer owns allocation; the
//! activation layer only borrows buffers for the duration of a launch.

use lumen_common::{KernelError, Result};

use crate::device::DeviceId;

#[cfg(feature = "cuda")]
use cudarc::driver::CudaSlice;

/// Element types that may live in a device buffer.
#[cfg(feature = "cuda")]
pub trait DeviceElement:
    Copy + Default + Send + Sync + 'static + cudarc::driver::DeviceRepr + cudarc::driver::ValidAsZeroBits
{
}

/// Element types that may live in a device buffer.
#[cfg(not(feature = "cuda"))]
pub trait DeviceElement: Copy + Default + Send + Sync + 'static {}

impl DeviceElement for f32 {}
impl DeviceElement for u8 {}

pub(crate) enum Storage<T> {
    Host(Vec<T>),
    #[cfg(feature = "cuda")]
    Cuda(CudaSlice<T>),
}

/// A flat allocation of `len()` elements on one device.
pub struct DeviceBuffer<T> {
    device: DeviceId,
    storage: Storage<T>,
}

impl<T> DeviceBuffer<T> {
    pub(crate) fn from_host(device: DeviceId, data: Vec<T>) -> Self {
        Self { device, storage: Storage::Host(data) }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn from_cuda(device: DeviceId, slice: CudaSlice<T>) -> Self {
        Self { device, storage: Storage::Cuda(slice) }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Host(data) => data.len(),
            #[cfg(feature = "cuda")]
            Storage::Cuda(slice) => slice.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the backend that allocated this buffer.
    pub fn kind(&self) -> &'static str {
        match &self.storage {
            Storage::Host(_) => "host",
            #[cfg(feature = "cuda")]
            Storage::Cuda(_) => "cuda",
        }
    }

    pub(crate) fn storage(&self) -> &Storage<T> {
        &self.storage
    }

    #[cfg_attr(not(feature = "cuda"), allow(dead_code))]
    pub(crate) fn storage_mut(&mut self) -> &mut Storage<T> {
        &mut self.storage
    }

    /// Host-emulated contents.
    pub(crate) fn host(&self) -> Result<&[T]> {
        match &self.storage {
            Storage::Host(data) => Ok(data),
            #[cfg(feature = "cuda")]
            Storage::Cuda(_) => Err(foreign_buffer("host")),
        }
    }

    pub(crate) fn host_mut(&mut self) -> Result<&mut Vec<T>> {
        match &mut self.storage {
            Storage::Host(data) => Ok(data),
            #[cfg(feature = "cuda")]
            Storage::Cuda(_) => Err(foreign_buffer("host")),
        }
    }
}

impl<T> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
pub(crate) fn foreign_buffer(backend: &str) -> lumen_common::LumenError {
    KernelError::unsupported(format!("{backend} backend"), "buffers allocated by another backend")
        .into()
}

/// A device allocation holding independent rows of `f32`, each starting
/// `pitch` elements after the previous one.
///
/// Width and height are supplied per call; [`PitchedBuffer::check_region`]
/// enforces `pitch >= width` and that every row fits in the allocation.
/// Elements between `width` and `pitch` in a row are padding and are never
/// touched by a launch.
#[derive(Debug)]
pub struct PitchedBuffer {
    buffer: DeviceBuffer<f32>,
    pitch: usize,
}

impl PitchedBuffer {
    /// Wrap `buffer` as rows of `pitch` elements.
    pub fn new(buffer: DeviceBuffer<f32>, pitch: usize) -> Result<Self> {
        if pitch == 0 {
            return Err(KernelError::invalid_shape("pitch must be non-zero").into());
        }
        Ok(Self { buffer, pitch })
    }

    /// Row pitch in elements.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Row pitch in bytes, as passed to kernels.
    pub fn pitch_bytes(&self) -> usize {
        self.pitch * std::mem::size_of::<f32>()
    }

    pub fn device(&self) -> DeviceId {
        self.buffer.device()
    }

    pub fn buffer(&self) -> &DeviceBuffer<f32> {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut DeviceBuffer<f32> {
        &mut self.buffer
    }

    pub fn into_inner(self) -> DeviceBuffer<f32> {
        self.buffer
    }

    /// Validate that `height` rows of `width` elements are addressable.
    pub fn check_region(&self, width: usize, height: usize) -> Result<()> {
        if width > self.pitch {
            return Err(KernelError::invalid_shape(format!(
                "pitch {} < width {width}",
                self.pitch
            ))
            .into());
        }
        if width == 0 || height == 0 {
            return Ok(());
        }
        let needed = (height - 1)
            .checked_mul(self.pitch)
            .and_then(|rows| rows.checked_add(width))
            .ok_or_else(|| KernelError::invalid_shape("pitched region overflows usize"))?;
        if needed > self.buffer.len() {
            return Err(KernelError::invalid_shape(format!(
                "{height} rows of width {width} at pitch {} need {needed} elements, buffer holds {}",
                self.pitch,
                self.buffer.len()
            ))
            .into());
        }
        Ok(())
    }
}
