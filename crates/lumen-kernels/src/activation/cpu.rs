//! CPU paths: strided and masked, in place.

use lumen_common::{KernelError, Result};

use super::{Activation, scalar};
use crate::mask;

impl Activation {
    /// Transform `count` elements at `buffer[i * stride]` in place.
    ///
    /// Elements between the strided positions and past the last one are
    /// never read or written. `count == 0` is a no-op.
    pub fn compute_strided(&self, buffer: &mut [f32], stride: usize, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if stride == 0 {
            return Err(KernelError::invalid_shape("stride must be non-zero").into());
        }
        let needed = (count - 1)
            .checked_mul(stride)
            .and_then(|v| v.checked_add(1))
            .ok_or_else(|| KernelError::invalid_shape("strided extent overflows usize"))?;
        if needed > buffer.len() {
            return Err(KernelError::invalid_shape(format!(
                "{count} elements at stride {stride} need {needed}, buffer holds {}",
                buffer.len()
            ))
            .into());
        }

        let elements = buffer.iter_mut().step_by(stride).take(count);
        self.apply_all(elements);
        Ok(())
    }

    /// Transform `buffer[i]` wherever `mask[i]` is set; other elements are
    /// left bit-for-bit unchanged.
    pub fn compute_conditional(&self, buffer: &mut [f32], mask: &[bool]) -> Result<()> {
        mask::check_host_mask(buffer.len(), mask.len())?;
        self.apply_all(mask::selected(buffer, mask));
        Ok(())
    }

    fn apply_all<'a>(&self, elements: impl Iterator<Item = &'a mut f32>) {
        match self {
            Self::SoftMax => {
                let mut group: Vec<&mut f32> = elements.collect();
                scalar::softmax(&mut group);
            }
            _ => {
                let (op, param) = (self.kernel_op(), self.param());
                for x in elements {
                    *x = op.apply(*x, param);
                }
            }
        }
    }
}
