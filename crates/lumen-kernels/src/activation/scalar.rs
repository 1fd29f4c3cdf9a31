//! Scalar activation math.
//!
//! Every execution path (scalar, strided CPU, host-emulated device) evaluates
//! through these functions, and the CUDA catalog spells out the same
//! expressions. The rectifiers branch on `x < 0` exactly: `-0.0` and NaN
//! take the identity branch.

/// ReLU: `x < 0 ? 0 : x`
#[inline]
pub fn relu(x: f32) -> f32 {
    if x < 0.0 { 0.0 } else { x }
}

/// Leaky ReLU: `x < 0 ? x * alpha : x`
#[inline]
pub fn leaky_relu(x: f32, alpha: f32) -> f32 {
    if x < 0.0 { x * alpha } else { x }
}

/// Sigmoid: `1 / (1 + exp(-x))`
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn tanh_act(x: f32) -> f32 {
    x.tanh()
}

/// Numerically stable softmax over the referenced values, in place.
///
/// The values need not be contiguous; strided and masked callers collect
/// references to exactly the elements that take part.
pub fn softmax(values: &mut [&mut f32]) {
    if values.is_empty() {
        return;
    }
    let max = values.iter().fold(f32::NEG_INFINITY, |m, v| m.max(**v));
    let mut sum = 0.0_f32;
    for v in values.iter_mut() {
        let e = (**v - max).exp();
        **v = e;
        sum += e;
    }
    for v in values.iter_mut() {
        **v /= sum;
    }
}

// ── Derivatives (w.r.t. the pre-activation value) ───────────────────

#[inline]
pub fn relu_derivative(x: f32) -> f32 {
    if x < 0.0 { 0.0 } else { 1.0 }
}

#[inline]
pub fn leaky_relu_derivative(x: f32, alpha: f32) -> f32 {
    if x < 0.0 { alpha } else { 1.0 }
}

#[inline]
pub fn sigmoid_derivative(x: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

#[inline]
pub fn tanh_derivative(x: f32) -> f32 {
    let t = x.tanh();
    1.0 - t * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_boundary() {
        assert_eq!(relu(-1e-30), 0.0);
        assert_eq!(relu(0.0), 0.0);
        assert!(relu(-0.0).is_sign_negative());
        assert!(relu(f32::NAN).is_nan());
    }

    #[test]
    fn test_leaky_relu_boundary() {
        assert_eq!(leaky_relu(-2.0, 0.5), -1.0);
        assert_eq!(leaky_relu(2.0, 0.5), 2.0);
        assert!(leaky_relu(-0.0, 0.5).is_sign_negative());
        assert!(leaky_relu(f32::NAN, 0.5).is_nan());
    }

    #[test]
    fn test_sigmoid_known_values() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!((sigmoid(100.0) - 1.0).abs() < 1e-6);
        assert!(sigmoid(-100.0) < 1e-6);
        // sigmoid(-x) = 1 - sigmoid(x)
        assert!((sigmoid(-2.5) - (1.0 - sigmoid(2.5))).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let (mut a, mut b, mut c) = (1.0f32, 2.0f32, 3.0f32);
        softmax(&mut [&mut a, &mut b, &mut c]);
        assert!((a + b + c - 1.0).abs() < 1e-6);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_softmax_is_shift_invariant_and_stable() {
        let (mut a, mut b) = (1000.0f32, 1001.0f32);
        softmax(&mut [&mut a, &mut b]);
        let (mut c, mut d) = (0.0f32, 1.0f32);
        softmax(&mut [&mut c, &mut d]);
        assert!(a.is_finite() && b.is_finite());
        assert!((a - c).abs() < 1e-6);
        assert!((b - d).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_empty_is_noop() {
        softmax(&mut []);
    }

    #[test]
    fn test_derivatives() {
        assert_eq!(relu_derivative(-1.0), 0.0);
        assert_eq!(relu_derivative(0.0), 1.0);
        assert_eq!(leaky_relu_derivative(-1.0, 0.3), 0.3);
        assert!((sigmoid_derivative(0.0) - 0.25).abs() < 1e-7);
        assert!((tanh_derivative(0.0) - 1.0).abs() < 1e-7);
    }
}
