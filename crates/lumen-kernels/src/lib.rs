//! Activation kernels for scalar, CPU, single-device and multi-device
//! execution.
//!
//! The entry point is [`Activation`]. Device paths take a [`DeviceContext`]
//! bound from a [`DeviceRegistry`], which owns the backend, each device's
//! limits and the per-device kernel cache:
//!
//! ```
//! use lumen_kernels::{Activation, DeviceRegistry, HostBackend};
//!
//! let registry = DeviceRegistry::new(HostBackend::new(2, 1024))?;
//! let ctx = registry.bind(1)?;
//! let stream = ctx.create_stream()?;
//!
//! let mut data = stream.upload(&[-2.0f32, -1.0, 0.0, 1.0, 2.0])?;
//! Activation::leaky_relu_with(0.5).compute_gpu(&ctx, &mut data, 5, &stream)?;
//! stream.synchronize()?;
//! assert_eq!(stream.download(&data)?, vec![-1.0, -0.5, 0.0, 1.0, 2.0]);
//!
//! registry.shutdown();
//! # Ok::<(), lumen_common::LumenError>(())
//! ```

pub mod activation;
pub mod backend;
pub mod buffer;
pub mod catalog;
pub mod device;
pub mod geometry;
pub mod mask;
pub mod stream;

pub use activation::{Activation, DEFAULT_LEAKY_ALPHA};
#[cfg(feature = "cuda")]
pub use backend::CudaBackend;
pub use backend::{HostBackend, KernelArg, KernelBackend, KernelHandle, ModuleHandle};
pub use buffer::{DeviceBuffer, DeviceElement, PitchedBuffer};
pub use device::{DeviceContext, DeviceId, DeviceRegistry};
pub use geometry::LaunchGeometry;
pub use lumen_common::{KernelError, LumenError, Result};
pub use stream::Stream;
