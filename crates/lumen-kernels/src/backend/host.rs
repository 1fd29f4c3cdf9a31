//! Host-emulated devices.
//!
//! Each emulated device has its own threads-per-block limit. A launch walks
//! the whole grid (`blockIdx.y`, `blockIdx.x`, `threadIdx.x`) and runs the
//! catalog entry per thread, or per row for row reductions, so the geometry
//! a caller plans is exercised exactly as a device would execute it. Work
//! runs at enqueue time, which trivially preserves in-stream ordering.

use log::{debug, trace};
use lumen_common::{KernelError, Result};

use super::{KernelArg, KernelBackend, KernelHandle, KernelInner, ModuleHandle, ModuleInner};
use crate::activation::scalar;
use crate::buffer::foreign_buffer;
use crate::catalog::{KernelEntry, KernelModule, KernelOp, Layout};
use crate::device::DeviceId;
use crate::geometry::LaunchGeometry;
use crate::mask;
use crate::stream::Stream;

#[derive(Debug, Clone)]
pub struct HostBackend {
    limits: Vec<u32>,
}

impl HostBackend {
    /// `devices` emulated devices sharing one block limit.
    pub fn new(devices: usize, max_threads_per_block: u32) -> Self {
        Self::with_limits(vec![max_threads_per_block; devices])
    }

    /// One emulated device per entry of `limits`.
    pub fn with_limits(limits: Vec<u32>) -> Self {
        Self { limits }
    }

    fn limit(&self, device: DeviceId) -> Result<u32> {
        self.limits.get(device.index()).copied().ok_or_else(|| {
            KernelError::DeviceUnavailable {
                device: device.index(),
                reason: format!("host backend has {} devices", self.limits.len()),
            }
            .into()
        })
    }
}

impl KernelBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn device_count(&self) -> usize {
        self.limits.len()
    }

    fn max_threads_per_block(&self, device: DeviceId) -> Result<u32> {
        self.limit(device)
    }

    fn create_stream(&self, device: DeviceId) -> Result<Stream> {
        self.limit(device)?;
        Ok(Stream::host(device))
    }

    fn load_module(&self, device: DeviceId, module: &'static KernelModule) -> Result<ModuleHandle> {
        self.limit(device)?;
        debug!("host: loading module {} on device {device}", module.name);
        Ok(ModuleHandle::new(device, module, ModuleInner::Host))
    }

    fn load_function(&self, module: &ModuleHandle, entry: &'static KernelEntry) -> Result<KernelHandle> {
        if !matches!(module.inner(), ModuleInner::Host) {
            return Err(KernelError::KernelLoadFailure {
                module: module.name().to_string(),
                entry: entry.name.to_string(),
                reason: "module was loaded by another backend".to_string(),
            }
            .into());
        }
        Ok(KernelHandle::new(module, entry, KernelInner::Host))
    }

    fn launch(
        &self,
        kernel: &KernelHandle,
        geometry: &LaunchGeometry,
        stream: &Stream,
        args: &mut [KernelArg<'_>],
    ) -> Result<()> {
        if !matches!(kernel.inner(), KernelInner::Host) || stream.kind() != self.name() {
            return Err(foreign_buffer(self.name()));
        }
        if kernel.device() != stream.device() {
            return Err(KernelError::launch(format!(
                "kernel for device {} enqueued on a stream of device {}",
                kernel.device(),
                stream.device()
            ))
            .into());
        }
        let limit = self.limit(kernel.device())?;
        if geometry.block_size_x == 0 || geometry.block_size_x > limit {
            return Err(KernelError::launch(format!(
                "block size {} outside device limit {limit}",
                geometry.block_size_x
            ))
            .into());
        }

        let entry = kernel.entry();
        let param = match args.last() {
            Some(KernelArg::Scalar(p)) => *p,
            _ => return Err(bad_args(entry)),
        };
        let (data, mask, len, pitch) = match (entry.layout, &mut args[..]) {
            (Layout::Flat, [KernelArg::Data(data), KernelArg::Len(n), _]) => {
                let n = to_usize(*n)?;
                (data, None, n, n)
            }
            (Layout::Pitched, [KernelArg::Data(data), KernelArg::Len(w), KernelArg::Len(pb), _]) => {
                (data, None, to_usize(*w)?, pitch_elements(*pb)?)
            }
            (Layout::Stacked, [KernelArg::Data(data), KernelArg::Mask(m), KernelArg::Len(n), _]) => {
                let n = to_usize(*n)?;
                (data, Some(m.host()?), n, n)
            }
            (
                Layout::PitchedMasked,
                [KernelArg::Data(data), KernelArg::Mask(m), KernelArg::Len(w), KernelArg::Len(pb), _],
            ) => (data, Some(m.host()?), to_usize(*w)?, pitch_elements(*pb)?),
            _ => return Err(bad_args(entry)),
        };
        if data.device() != kernel.device() {
            return Err(KernelError::launch(format!(
                "buffer on device {} passed to a kernel on device {}",
                data.device(),
                kernel.device()
            ))
            .into());
        }
        let data = data.host_mut()?;

        let rows = geometry.grid_size_y as usize;
        check_bounds(entry, rows, len, pitch, data.len(), mask.map(<[u8]>::len))?;

        trace!("host: {} grid={:?} block={:?}", entry.name, geometry.grid_dim(), geometry.block_dim());
        stream.record_launch();

        if entry.op.is_row_reduction() {
            if geometry.grid_size_x != 1 {
                return Err(KernelError::launch(format!(
                    "{} needs one block per row, got grid_size_x {}",
                    entry.name, geometry.grid_size_x
                ))
                .into());
            }
            for y in 0..rows {
                let row = &mut data[y * pitch..y * pitch + len];
                let mut values: Vec<&mut f32> = match mask {
                    Some(m) => mask::selected_bytes(row, &m[y * len..(y + 1) * len]).collect(),
                    None => row.iter_mut().collect(),
                };
                scalar::softmax(&mut values);
            }
            return Ok(());
        }

        let op: KernelOp = entry.op;
        let block = geometry.block_size_x as usize;
        for y in 0..rows {
            for bx in 0..geometry.grid_size_x as usize {
                for tx in 0..block {
                    let col = bx * block + tx;
                    if col >= len {
                        continue;
                    }
                    if mask.is_some_and(|m| !mask::is_set(m[y * len + col])) {
                        continue;
                    }
                    let i = y * pitch + col;
                    data[i] = op.apply(data[i], param);
                }
            }
        }
        Ok(())
    }
}

fn bad_args(entry: &KernelEntry) -> lumen_common::LumenError {
    KernelError::launch(format!("arguments do not match the signature of {}", entry.name)).into()
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| KernelError::launch(format!("{v} does not fit in usize")).into())
}

fn pitch_elements(pitch_bytes: u64) -> Result<usize> {
    let elem = std::mem::size_of::<f32>() as u64;
    if pitch_bytes % elem != 0 {
        return Err(KernelError::launch(format!("misaligned pitch of {pitch_bytes} bytes")).into());
    }
    to_usize(pitch_bytes / elem)
}

/// Reject launches that would address outside the buffers they were given.
fn check_bounds(
    entry: &KernelEntry,
    rows: usize,
    len: usize,
    pitch: usize,
    data_len: usize,
    mask_len: Option<usize>,
) -> Result<()> {
    if rows == 0 || len == 0 {
        return Ok(());
    }
    let illegal = |what: &str| -> lumen_common::LumenError {
        KernelError::launch(format!("{}: illegal address in {what}", entry.name)).into()
    };
    let data_needed = (rows - 1)
        .checked_mul(pitch)
        .and_then(|v| v.checked_add(len))
        .ok_or_else(|| illegal("data"))?;
    if data_needed > data_len {
        return Err(illegal("data"));
    }
    if let Some(mask_len) = mask_len {
        let mask_needed = rows.checked_mul(len).ok_or_else(|| illegal("mask"))?;
        if mask_needed > mask_len {
            return Err(illegal("mask"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, ACTIVATION};
    use crate::geometry;

    fn kernel(backend: &HostBackend, device: usize, name: &str) -> KernelHandle {
        let (module, entry) = catalog::entry(ACTIVATION, name).unwrap();
        let module = backend.load_module(DeviceId(device), module).unwrap();
        backend.load_function(&module, entry).unwrap()
    }

    #[test]
    fn test_unknown_device_is_unavailable() {
        let backend = HostBackend::new(2, 256);
        assert_eq!(backend.device_count(), 2);
        let err = backend.max_threads_per_block(DeviceId(2)).unwrap_err();
        assert!(matches!(err.as_kernel(), Some(KernelError::DeviceUnavailable { device: 2, .. })));
        assert!(backend.create_stream(DeviceId(5)).is_err());
    }

    #[test]
    fn test_per_device_limits() {
        let backend = HostBackend::with_limits(vec![1024, 64]);
        assert_eq!(backend.max_threads_per_block(DeviceId(0)).unwrap(), 1024);
        assert_eq!(backend.max_threads_per_block(DeviceId(1)).unwrap(), 64);
    }

    #[test]
    fn test_flat_launch_covers_every_element() {
        let backend = HostBackend::new(1, 4);
        let stream = backend.create_stream(DeviceId(0)).unwrap();
        let k = kernel(&backend, 0, "relu");
        let mut data = stream.upload(&[-1.0f32, 2.0, -3.0, 4.0, -5.0, 6.0, -7.0]).unwrap();
        let g = geometry::plan_flat(7, 4).unwrap().unwrap();
        backend
            .launch(&k, &g, &stream, &mut [KernelArg::Data(&mut data), KernelArg::Len(7), KernelArg::Scalar(0.0)])
            .unwrap();
        assert_eq!(stream.download(&data).unwrap(), vec![0.0, 2.0, 0.0, 4.0, 0.0, 6.0, 0.0]);
        assert_eq!(stream.launches(), 1);
    }

    #[test]
    fn test_block_over_device_limit_fails() {
        let backend = HostBackend::new(1, 4);
        let stream = backend.create_stream(DeviceId(0)).unwrap();
        let k = kernel(&backend, 0, "relu");
        let mut data = stream.upload(&[0.0f32; 8]).unwrap();
        let g = geometry::plan_flat(8, 8).unwrap().unwrap();
        let err = backend
            .launch(&k, &g, &stream, &mut [KernelArg::Data(&mut data), KernelArg::Len(8), KernelArg::Scalar(0.0)])
            .unwrap_err();
        assert!(matches!(err.as_kernel(), Some(KernelError::LaunchFailure { .. })));
        assert_eq!(stream.launches(), 0);
    }

    #[test]
    fn test_out_of_bounds_launch_is_rejected() {
        let backend = HostBackend::new(1, 1024);
        let stream = backend.create_stream(DeviceId(0)).unwrap();
        let k = kernel(&backend, 0, "sigmoid");
        let mut data = stream.upload(&[0.0f32; 3]).unwrap();
        let g = geometry::plan_flat(4, 1024).unwrap().unwrap();
        let err = backend
            .launch(&k, &g, &stream, &mut [KernelArg::Data(&mut data), KernelArg::Len(4), KernelArg::Scalar(0.0)])
            .unwrap_err();
        assert!(err.to_string().contains("illegal address"));
    }

    #[test]
    fn test_mismatched_arguments_are_rejected() {
        let backend = HostBackend::new(1, 1024);
        let stream = backend.create_stream(DeviceId(0)).unwrap();
        let k = kernel(&backend, 0, "multi_relu");
        let mut data = stream.upload(&[0.0f32; 4]).unwrap();
        let g = geometry::plan_flat(4, 1024).unwrap().unwrap();
        let err = backend
            .launch(&k, &g, &stream, &mut [KernelArg::Data(&mut data), KernelArg::Len(4), KernelArg::Scalar(0.0)])
            .unwrap_err();
        assert!(err.to_string().contains("multi_relu"));
    }

    #[test]
    fn test_kernel_and_stream_must_share_a_device() {
        let backend = HostBackend::new(2, 1024);
        let stream = backend.create_stream(DeviceId(1)).unwrap();
        let k = kernel(&backend, 0, "relu");
        let mut data = stream.upload(&[0.0f32; 2]).unwrap();
        let g = geometry::plan_flat(2, 1024).unwrap().unwrap();
        assert!(
            backend
                .launch(&k, &g, &stream, &mut [KernelArg::Data(&mut data), KernelArg::Len(2), KernelArg::Scalar(0.0)])
                .is_err()
        );
    }

    #[test]
    fn test_pitched_softmax_normalises_each_row() {
        let backend = HostBackend::new(1, 1024);
        let stream = backend.create_stream(DeviceId(0)).unwrap();
        let k = kernel(&backend, 0, "multi_softmax");
        let mut p = stream.upload_pitched(&[1.0, 1.0, 0.0, 5.0], 2, 3, 42.0).unwrap();
        let g = geometry::plan_rows(2, 2, 1024).unwrap().unwrap();
        let pitch_bytes = p.pitch_bytes() as u64;
        backend
            .launch(
                &k,
                &g,
                &stream,
                &mut [
                    KernelArg::Data(p.buffer_mut()),
                    KernelArg::Len(2),
                    KernelArg::Len(pitch_bytes),
                    KernelArg::Scalar(0.0),
                ],
            )
            .unwrap();
        let out = stream.download(p.buffer()).unwrap();
        assert!((out[0] - 0.5).abs() < 1e-6 && (out[1] - 0.5).abs() < 1e-6);
        assert!((out[3] + out[4] - 1.0).abs() < 1e-6);
        assert_eq!(out[2], 42.0);
        assert_eq!(out[5], 42.0);
    }
}
