//! Activation functions.
//!
//! [`Activation`] is a closed set of nonlinearities. Each kind runs on five
//! execution paths:
//!
//! - scalar: [`Activation::compute`]
//! - CPU strided: [`Activation::compute_strided`], [`Activation::compute_conditional`]
//! - device flat: [`Activation::compute_gpu`], [`Activation::compute_gpu_conditional`]
//! - device pitched: [`Activation::compute_multi_gpu`],
//!   [`Activation::compute_multi_gpu_conditional`]
//!
//! All paths evaluate through [`scalar`] (or its CUDA transcription in the
//! kernel catalog), so they share one decision boundary and agree element
//! for element.
//!
//! # SoftMax
//!
//! SoftMax is the one kind that is not elementwise. It normalises over
//! whatever group a path operates on: the `count` strided elements on the
//! CPU, all `size` elements of a flat device buffer, each row of a pitched
//! buffer, and the selected elements of each problem on masked paths. The
//! scalar form is the singleton softmax.

mod cpu;
mod device;
pub mod scalar;

use lumen_common::{KernelError, Result};

use crate::catalog::KernelOp;

/// Leak coefficient used by [`Activation::leaky_relu`].
pub const DEFAULT_LEAKY_ALPHA: f32 = 0.3;

/// A nonlinearity and its parameters. Immutable; share freely across
/// threads and devices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Identity,
    Sigmoid,
    Tanh,
    SoftMax,
    ReLU,
    /// `x < 0 ? x * alpha : x`
    LeakyReLU {
        alpha: f32,
    },
}

impl Activation {
    /// Leaky ReLU with [`DEFAULT_LEAKY_ALPHA`].
    pub fn leaky_relu() -> Self {
        Self::LeakyReLU { alpha: DEFAULT_LEAKY_ALPHA }
    }

    pub fn leaky_relu_with(alpha: f32) -> Self {
        Self::LeakyReLU { alpha }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::SoftMax => "softmax",
            Self::ReLU => "relu",
            Self::LeakyReLU { .. } => "leaky_relu",
        }
    }

    pub(crate) fn kernel_op(&self) -> KernelOp {
        match self {
            Self::Identity => KernelOp::Identity,
            Self::Sigmoid => KernelOp::Sigmoid,
            Self::Tanh => KernelOp::Tanh,
            Self::SoftMax => KernelOp::SoftMax,
            Self::ReLU => KernelOp::ReLU,
            Self::LeakyReLU { .. } => KernelOp::LeakyReLU,
        }
    }

    /// The scalar kernel parameter: the leak coefficient, zero otherwise.
    pub(crate) fn param(&self) -> f32 {
        match self {
            Self::LeakyReLU { alpha } => *alpha,
            _ => 0.0,
        }
    }

    /// Evaluate one value.
    #[inline]
    pub fn compute(&self, x: f32) -> f32 {
        self.kernel_op().apply(x, self.param())
    }

    /// Replace `buffer[from..to]` with the derivative of the activation,
    /// evaluated at the pre-activation values stored there.
    ///
    /// # Errors
    ///
    /// - [`KernelError::UnsupportedOperation`] for [`Activation::SoftMax`],
    ///   whose Jacobian is not diagonal.
    /// - [`KernelError::InvalidWorkloadShape`] if `from > to` or
    ///   `to > buffer.len()`.
    pub fn derivative(&self, buffer: &mut [f32], from: usize, to: usize) -> Result<()> {
        let f: fn(f32, f32) -> f32 = match self {
            Self::Identity => |_, _| 1.0,
            Self::Sigmoid => |x, _| scalar::sigmoid_derivative(x),
            Self::Tanh => |x, _| scalar::tanh_derivative(x),
            Self::ReLU => |x, _| scalar::relu_derivative(x),
            Self::LeakyReLU { .. } => scalar::leaky_relu_derivative,
            Self::SoftMax => {
                return Err(KernelError::unsupported(self.name(), "elementwise derivative").into());
            }
        };
        if from > to || to > buffer.len() {
            return Err(KernelError::invalid_shape(format!(
                "derivative range {from}..{to} outside buffer of {}",
                buffer.len()
            ))
            .into());
        }
        let param = self.param();
        for x in &mut buffer[from..to] {
            *x = f(*x, param);
        }
        Ok(())
    }
}

impl std::fmt::Display for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeakyReLU { alpha } => write!(f, "leaky_relu(alpha={alpha})"),
            other => f.write_str(other.name()),
        }
    }
}
