//! Shared step-control pieces: counters, error weights, and the weighted
//! RMS norm.

use crate::Float;

/// Per-IVP work counters.
///
/// `niters` counts step attempts (accepted and rejected); `nsteps` counts
/// accepted steps. Both are monotone over a solve, and
/// `niters - nsteps` equals the number of rejections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Step attempts, accepted and rejected.
    pub niters: usize,
    /// Accepted steps.
    pub nsteps: usize,
}

/// Inverse error weights from a single state: `sc[k] = 1 / (atol + rtol * |y[k]|)`.
pub(crate) fn scale_init(atol: Float, rtol: Float, y: &[Float], sc: &mut [Float]) {
    for i in 0..y.len() {
        sc[i] = 1.0 / (atol + y[i].abs() * rtol);
    }
}

/// Inverse error weights spanning two states:
/// `sc[k] = 1 / (atol + rtol * max(|ya[k]|, |yb[k]|))`.
pub(crate) fn scale(atol: Float, rtol: Float, ya: &[Float], yb: &[Float], sc: &mut [Float]) {
    for i in 0..ya.len() {
        sc[i] = 1.0 / (atol + ya[i].abs().max(yb[i].abs()) * rtol);
    }
}

/// Weighted RMS norm `sqrt(mean((z[k] * sc[k])^2))`, floored at 1e-10.
pub(crate) fn wnorm(sc: &[Float], z: &[Float]) -> Float {
    let mut sum = 0.0;
    for i in 0..z.len() {
        let v = sc[i] * z[i];
        sum += v * v;
    }
    (sum / z.len() as Float).sqrt().max(1e-10)
}
