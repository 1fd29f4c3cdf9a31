//! Conditional mask application.
//!
//! A mask has the same cardinality as the data it guards: element `i` is
//! transformed when `mask[i]` is set and left bit-for-bit unchanged
//! otherwise. Host masks are `&[bool]`; device masks are `u8` buffers where
//! any nonzero byte means "set".
//!
//! Mask and data must live on the same substrate (both host, or both on the
//! same device). That is a caller precondition and is not checked here.

use lumen_common::{KernelError, Result};

/// Encode a host mask for upload to a device.
pub fn encode(mask: &[bool]) -> Vec<u8> {
    mask.iter().map(|&set| u8::from(set)).collect()
}

#[inline]
pub fn is_set(byte: u8) -> bool {
    byte != 0
}

/// Require a host mask of exactly `data_len` entries.
pub fn check_host_mask(data_len: usize, mask_len: usize) -> Result<()> {
    if data_len != mask_len {
        return Err(KernelError::invalid_shape(format!(
            "mask has {mask_len} entries for {data_len} data elements"
        ))
        .into());
    }
    Ok(())
}

/// Require a device mask of at least `needed` entries.
pub fn check_device_mask(needed: usize, mask_len: usize) -> Result<()> {
    if mask_len < needed {
        return Err(KernelError::invalid_shape(format!(
            "mask has {mask_len} entries, launch reads {needed}"
        ))
        .into());
    }
    Ok(())
}

/// The elements of `data` selected by `mask`, in index order.
pub fn selected<'a>(data: &'a mut [f32], mask: &'a [bool]) -> impl Iterator<Item = &'a mut f32> {
    data.iter_mut().zip(mask).filter(|(_, set)| **set).map(|(x, _)| x)
}

/// Like [`selected`], for device-encoded masks.
pub fn selected_bytes<'a>(
    data: &'a mut [f32],
    mask: &'a [u8],
) -> impl Iterator<Item = &'a mut f32> {
    data.iter_mut().zip(mask).filter(|(_, byte)| is_set(**byte)).map(|(x, _)| x)
}
