//! Launch geometry planning.
//!
//! Maps a workload shape and a device's threads-per-block limit to a
//! `{block_size_x, grid_size_x, grid_size_y}` launch. Every planner is pure:
//! zero work plans to `None` (nothing is dispatched) and shapes the hardware
//! cannot address are rejected instead of clamped.
//!
//! - [`plan_flat`]: `size` elements in one strip of blocks.
//! - [`plan_pitched`]: `height` pitched rows of `width` elements, one strip per row.
//! - [`plan_stacked`]: `count` independent problems of `size` elements.
//! - [`plan_rows`]: one block per row, for row-reduction kernels (softmax).

use log::warn;
use lumen_common::{KernelError, Result};

/// Largest `gridDim.x` supported by compute capability 3.0+.
pub const MAX_GRID_X: u32 = i32::MAX as u32;
/// Largest `gridDim.y`.
pub const MAX_GRID_Y: u32 = 65_535;

/// Grid/block configuration for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub block_size_x: u32,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    /// Dynamic shared memory per block, in bytes.
    pub shared_mem_bytes: u32,
}

impl LaunchGeometry {
    /// CUDA grid dimensions.
    pub fn grid_dim(&self) -> (u32, u32, u32) {
        (self.grid_size_x, self.grid_size_y, 1)
    }

    /// CUDA block dimensions.
    pub fn block_dim(&self) -> (u32, u32, u32) {
        (self.block_size_x, 1, 1)
    }

    /// Threads along x across the whole grid.
    pub fn threads_x(&self) -> u64 {
        u64::from(self.block_size_x) * u64::from(self.grid_size_x)
    }

    pub fn total_threads(&self) -> u64 {
        self.threads_x() * u64::from(self.grid_size_y)
    }

    #[cfg(feature = "cuda")]
    pub fn to_launch_config(&self) -> cudarc::driver::LaunchConfig {
        cudarc::driver::LaunchConfig {
            grid_dim: self.grid_dim(),
            block_dim: self.block_dim(),
            shared_mem_bytes: self.shared_mem_bytes,
        }
    }
}

/// Plan a flat launch over `size` elements.
pub fn plan_flat(size: usize, max_threads: u32) -> Result<Option<LaunchGeometry>> {
    plan_strips(size, 1, max_threads)
}

/// Plan a pitched launch: the x geometry comes from `width`, `grid_size_y = height`.
pub fn plan_pitched(width: usize, height: usize, max_threads: u32) -> Result<Option<LaunchGeometry>> {
    plan_strips(width, height, max_threads)
}

/// Plan `count` stacked problems of `size` elements each (`grid_size_y = count`).
pub fn plan_stacked(size: usize, count: usize, max_threads: u32) -> Result<Option<LaunchGeometry>> {
    plan_strips(size, count, max_threads)
}

/// Plan a row-reduction launch: one block of a power-of-two size per row,
/// with one `f32` of shared memory per thread.
pub fn plan_rows(width: usize, rows: usize, max_threads: u32) -> Result<Option<LaunchGeometry>> {
    check_max_threads(max_threads)?;
    if width == 0 || rows == 0 {
        return Ok(None);
    }
    check_grid_y(rows)?;

    let wanted = (max_threads as usize).min(width) as u32;
    let block_size_x = 1u32 << (u32::BITS - 1 - wanted.leading_zeros());

    Ok(Some(LaunchGeometry {
        block_size_x,
        grid_size_x: 1,
        grid_size_y: rows as u32,
        shared_mem_bytes: block_size_x * std::mem::size_of::<f32>() as u32,
    }))
}

fn plan_strips(extent: usize, rows: usize, max_threads: u32) -> Result<Option<LaunchGeometry>> {
    check_max_threads(max_threads)?;
    if extent == 0 || rows == 0 {
        return Ok(None);
    }
    check_grid_y(rows)?;

    let block_size_x = (max_threads as usize).min(extent);
    let grid_size_x = extent.div_ceil(block_size_x);
    if grid_size_x > MAX_GRID_X as usize {
        return Err(KernelError::invalid_shape(format!(
            "grid_size_x {grid_size_x} exceeds device limit {MAX_GRID_X}"
        ))
        .into());
    }

    Ok(Some(LaunchGeometry {
        block_size_x: block_size_x as u32,
        grid_size_x: grid_size_x as u32,
        grid_size_y: rows as u32,
        shared_mem_bytes: 0,
    }))
}

fn check_max_threads(max_threads: u32) -> Result<()> {
    if max_threads == 0 {
        return Err(KernelError::invalid_shape("max threads per block must be non-zero").into());
    }
    Ok(())
}

fn check_grid_y(rows: usize) -> Result<()> {
    if rows > MAX_GRID_Y as usize {
        warn!("rejecting launch with {rows} rows (limit {MAX_GRID_Y})");
        return Err(KernelError::invalid_shape(format!(
            "grid_size_y {rows} exceeds device limit {MAX_GRID_Y}"
        ))
        .into());
    }
    Ok(())
}
