//! Device paths.
//!
//! Each call validates the region against the buffers it was given, plans a
//! launch for the context's device, resolves the catalog entry and enqueues
//! it on `stream`. Nothing here waits on the stream. Zero work plans no
//! launch and returns `Ok(())` without touching the stream.

use log::{trace, warn};
use lumen_common::{KernelError, Result};

use super::Activation;
use crate::backend::KernelArg;
use crate::buffer::{DeviceBuffer, PitchedBuffer};
use crate::catalog::{self, Layout};
use crate::device::DeviceContext;
use crate::geometry::{self, LaunchGeometry};
use crate::mask;
use crate::stream::Stream;

impl Activation {
    /// Transform the first `size` elements of `data` on the context's device.
    pub fn compute_gpu(
        &self,
        ctx: &DeviceContext,
        data: &mut DeviceBuffer<f32>,
        size: usize,
        stream: &Stream,
    ) -> Result<()> {
        check_len("data", size, data.len())?;
        let max_threads = ctx.max_threads_per_block()?;
        let plan = if self.kernel_op().is_row_reduction() {
            geometry::plan_rows(size, 1, max_threads)?
        } else {
            geometry::plan_flat(size, max_threads)?
        };
        self.dispatch(
            ctx,
            Layout::Flat,
            plan,
            stream,
            &mut [KernelArg::Data(data), KernelArg::Len(size as u64), KernelArg::Scalar(self.param())],
        )
    }

    /// Transform `height` rows of `width` elements in a pitched buffer.
    /// Row padding between `width` and the pitch is never touched.
    pub fn compute_multi_gpu(
        &self,
        ctx: &DeviceContext,
        data: &mut PitchedBuffer,
        width: usize,
        height: usize,
        stream: &Stream,
    ) -> Result<()> {
        data.check_region(width, height)?;
        let plan = self.plan_rows_or_pitched(ctx, width, height)?;
        let pitch_bytes = data.pitch_bytes() as u64;
        self.dispatch(
            ctx,
            Layout::Pitched,
            plan,
            stream,
            &mut [
                KernelArg::Data(data.buffer_mut()),
                KernelArg::Len(width as u64),
                KernelArg::Len(pitch_bytes),
                KernelArg::Scalar(self.param()),
            ],
        )
    }

    /// Masked transform of `count` stacked problems of `size` elements.
    ///
    /// `data` and `mask` hold the problems back to back (`size * count`
    /// entries each); problem `p` occupies `p * size .. (p + 1) * size`.
    pub fn compute_gpu_conditional(
        &self,
        ctx: &DeviceContext,
        data: &mut DeviceBuffer<f32>,
        mask: &DeviceBuffer<u8>,
        size: usize,
        stream: &Stream,
        count: usize,
    ) -> Result<()> {
        let total = size
            .checked_mul(count)
            .ok_or_else(|| KernelError::invalid_shape("size * count overflows usize"))?;
        check_len("data", total, data.len())?;
        mask::check_device_mask(total, mask.len())?;
        let max_threads = ctx.max_threads_per_block()?;
        let plan = if self.kernel_op().is_row_reduction() {
            geometry::plan_rows(size, count, max_threads)?
        } else {
            geometry::plan_stacked(size, count, max_threads)?
        };
        self.dispatch(
            ctx,
            Layout::Stacked,
            plan,
            stream,
            &mut [
                KernelArg::Data(data),
                KernelArg::Mask(mask),
                KernelArg::Len(size as u64),
                KernelArg::Scalar(self.param()),
            ],
        )
    }

    /// Masked transform of a pitched region. The mask is dense:
    /// `mask[row * width + col]` guards element `(row, col)`.
    pub fn compute_multi_gpu_conditional(
        &self,
        ctx: &DeviceContext,
        data: &mut PitchedBuffer,
        mask: &DeviceBuffer<u8>,
        width: usize,
        height: usize,
        stream: &Stream,
    ) -> Result<()> {
        data.check_region(width, height)?;
        let total = width
            .checked_mul(height)
            .ok_or_else(|| KernelError::invalid_shape("width * height overflows usize"))?;
        mask::check_device_mask(total, mask.len())?;
        let plan = self.plan_rows_or_pitched(ctx, width, height)?;
        let pitch_bytes = data.pitch_bytes() as u64;
        self.dispatch(
            ctx,
            Layout::PitchedMasked,
            plan,
            stream,
            &mut [
                KernelArg::Data(data.buffer_mut()),
                KernelArg::Mask(mask),
                KernelArg::Len(width as u64),
                KernelArg::Len(pitch_bytes),
                KernelArg::Scalar(self.param()),
            ],
        )
    }

    fn plan_rows_or_pitched(
        &self,
        ctx: &DeviceContext,
        width: usize,
        height: usize,
    ) -> Result<Option<LaunchGeometry>> {
        let max_threads = ctx.max_threads_per_block()?;
        if self.kernel_op().is_row_reduction() {
            geometry::plan_rows(width, height, max_threads)
        } else {
            geometry::plan_pitched(width, height, max_threads)
        }
    }

    fn dispatch(
        &self,
        ctx: &DeviceContext,
        layout: Layout,
        plan: Option<LaunchGeometry>,
        stream: &Stream,
        args: &mut [KernelArg<'_>],
    ) -> Result<()> {
        let Some(geometry) = plan else {
            trace!("{self}: zero work on device {}, nothing launched", ctx.current_device());
            return Ok(());
        };
        let entry = catalog::entry_for(self.kernel_op(), layout);
        let kernel = ctx.kernel(catalog::ACTIVATION, entry)?;
        ctx.launch(&kernel, &geometry, stream, args)
    }
}

fn check_len(what: &str, needed: usize, len: usize) -> Result<()> {
    if needed > len {
        warn!("rejecting launch over {needed} {what} elements, buffer holds {len}");
        return Err(KernelError::invalid_shape(format!(
            "{what} buffer holds {len} elements, launch needs {needed}"
        ))
        .into());
    }
    Ok(())
}
