//! RKF45 - embedded Runge–Kutta–Fehlberg 4(5) adaptive integrator
//!
//! Six-stage Fehlberg pair with local extrapolation: the 5th-order
//! solution advances the state, the difference against the embedded
//! 4th-order formula supplies the per-component error estimate. The
//! non-stiff workhorse of the batch driver, and the template the
//! lock-step lane execution is lifted from.
//!
//! References:
//! - E. Fehlberg, NASA TR R-315 (1969)
//! - Hairer, Nørsett & Wanner, Solving Ordinary Differential Equations I

use crate::{
    error::ErrorCode,
    methods::{
        common::{scale, scale_init, wnorm, Counters},
        hinit::hinit,
    },
    ode::OdeSystem,
    options::SolverOptions,
    Float, UROUND,
};

/// Stage buffers for one trial step; allocated once per lane.
pub(crate) struct StageScratch {
    k1: Vec<Float>,
    k2: Vec<Float>,
    k3: Vec<Float>,
    k4: Vec<Float>,
    k5: Vec<Float>,
    k6: Vec<Float>,
    ytmp: Vec<Float>,
}

impl StageScratch {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            k1: vec![0.0; n],
            k2: vec![0.0; n],
            k3: vec![0.0; n],
            k4: vec![0.0; n],
            k5: vec![0.0; n],
            k6: vec![0.0; n],
            ytmp: vec![0.0; n],
        }
    }
}

/// One Fehlberg 4(5) trial step of size `h` over `[t, t + h]`.
///
/// Writes the 5th-order solution into `y_out` and the magnitude of the
/// embedded 4th/5th-order difference into `err`. Acceptance is the step
/// controller's job; the kernel itself never rejects.
pub(crate) fn rkf45_step<F: OdeSystem>(
    f: &F,
    t: Float,
    p: &[Float],
    y: &[Float],
    h: Float,
    y_out: &mut [Float],
    err: &mut [Float],
    ws: &mut StageScratch,
) {
    let n = y.len();

    f.rhs(t, p, y, &mut ws.k1);

    for i in 0..n {
        ws.ytmp[i] = y[i] + h * A21 * ws.k1[i];
    }
    f.rhs(t + C2 * h, p, &ws.ytmp, &mut ws.k2);

    for i in 0..n {
        ws.ytmp[i] = y[i] + h * (A31 * ws.k1[i] + A32 * ws.k2[i]);
    }
    f.rhs(t + C3 * h, p, &ws.ytmp, &mut ws.k3);

    for i in 0..n {
        ws.ytmp[i] = y[i] + h * (A41 * ws.k1[i] + A42 * ws.k2[i] + A43 * ws.k3[i]);
    }
    f.rhs(t + C4 * h, p, &ws.ytmp, &mut ws.k4);

    for i in 0..n {
        ws.ytmp[i] =
            y[i] + h * (A51 * ws.k1[i] + A52 * ws.k2[i] + A53 * ws.k3[i] + A54 * ws.k4[i]);
    }
    f.rhs(t + h, p, &ws.ytmp, &mut ws.k5);

    for i in 0..n {
        ws.ytmp[i] = y[i]
            + h * (A61 * ws.k1[i]
                + A62 * ws.k2[i]
                + A63 * ws.k3[i]
                + A64 * ws.k4[i]
                + A65 * ws.k5[i]);
    }
    f.rhs(t + C6 * h, p, &ws.ytmp, &mut ws.k6);

    for i in 0..n {
        y_out[i] = y[i]
            + h * (B1 * ws.k1[i]
                + B3 * ws.k3[i]
                + B4 * ws.k4[i]
                + B5 * ws.k5[i]
                + B6 * ws.k6[i]);
        err[i] = (h
            * (E1 * ws.k1[i] + E3 * ws.k3[i] + E4 * ws.k4[i] + E5 * ws.k5[i] + E6 * ws.k6[i]))
            .abs();
    }
}

/// Integrate one IVP from `t_start` to `t_end`, advancing `y` in place.
///
/// Acceptance: weighted error norm at most 1, or the stepsize already at
/// its floor. The next stepsize scales by `0.840896 * herr^(-1/4)`,
/// clamped to the configured adaption limit.
pub(crate) fn integrate<F: OdeSystem>(
    f: &F,
    t_start: Float,
    t_end: Float,
    p: &[Float],
    y: &mut [Float],
    opts: &SolverOptions,
    mut log: Option<&mut Vec<(Float, Vec<Float>)>>,
) -> (ErrorCode, Counters) {
    let n = y.len();
    let mut counters = Counters::default();

    let tdist = (t_end - t_start).abs();
    if tdist == 0.0 {
        // Zero-length interval: nothing to do.
        return (ErrorCode::Success, counters);
    }
    // The landing tolerance honours both the interval roundoff and the
    // resolution of t_end itself; the final step cannot land any closer.
    let roundoff = UROUND * tdist.max(t_end.abs());
    let posneg = (t_end - t_start).signum();
    let mut t = t_start;

    let hmin = 100.0 * UROUND * tdist;
    let hmax = tdist / opts.min_iters as Float;
    if hmin >= hmax {
        return (ErrorCode::TdistTooSmall, counters);
    }

    let mut ws = StageScratch::new(n);
    let mut y1 = vec![0.0; n];
    let mut errv = vec![0.0; n];
    let mut sc = vec![0.0; n];

    let mut h = if opts.h_init.abs() > hmin {
        opts.h_init.abs().min(hmax) * posneg
    } else {
        let mut f0 = vec![0.0; n];
        f.rhs(t, p, y, &mut f0);
        scale_init(opts.atol, opts.rtol, y, &mut sc);
        match hinit(f, t, t_end, p, y, &f0, &sc, opts.min_iters, &mut y1, &mut errv) {
            Ok(h0) => h0,
            Err(code) => return (code, counters),
        }
    };

    let mut code = ErrorCode::Success;
    while (t_end - t) * posneg > roundoff {
        if opts.max_iters > 0 && counters.niters >= opts.max_iters {
            code = ErrorCode::MaxStepsExceeded;
            break;
        }
        if 0.1 * h.abs() <= t.abs() * UROUND {
            code = ErrorCode::HPlusTEqualsH;
            break;
        }

        // Land exactly on t_end when the remaining span is within reach.
        let remaining = t_end - t;
        if (t + h - t_end) * posneg > 0.0 || (remaining - h).abs() <= hmin {
            h = remaining;
        }
        counters.niters += 1;

        rkf45_step(f, t, p, y, h, &mut y1, &mut errv, &mut ws);
        scale(opts.atol, opts.rtol, y, &y1, &mut sc);
        let herr = wnorm(&sc, &errv);

        let accept = herr <= 1.0 || h.abs() <= hmin;
        let fact = (ERR_SAFETY * herr.powf(-0.25))
            .clamp(1.0 / opts.adaption_limit, opts.adaption_limit);
        if accept {
            t += h;
            y.copy_from_slice(&y1);
            counters.nsteps += 1;
            if let Some(records) = log.as_deref_mut() {
                records.push((t, y.to_vec()));
            }
        }
        h = (h.abs() * fact).clamp(hmin, hmax) * posneg;
    }

    (code, counters)
}

// Safety factor 2^(-1/4) applied to the error-based stepsize ratio.
pub(crate) const ERR_SAFETY: Float = 0.840896415253714543;

// Fehlberg 4(5) tableau
pub(crate) const C2: Float = 1.0 / 4.0;
pub(crate) const C3: Float = 3.0 / 8.0;
pub(crate) const C4: Float = 12.0 / 13.0;
pub(crate) const C6: Float = 1.0 / 2.0;

pub(crate) const A21: Float = 1.0 / 4.0;
pub(crate) const A31: Float = 3.0 / 32.0;
pub(crate) const A32: Float = 9.0 / 32.0;
pub(crate) const A41: Float = 1932.0 / 2197.0;
pub(crate) const A42: Float = -7200.0 / 2197.0;
pub(crate) const A43: Float = 7296.0 / 2197.0;
pub(crate) const A51: Float = 439.0 / 216.0;
pub(crate) const A52: Float = -8.0;
pub(crate) const A53: Float = 3680.0 / 513.0;
pub(crate) const A54: Float = -845.0 / 4104.0;
pub(crate) const A61: Float = -8.0 / 27.0;
pub(crate) const A62: Float = 2.0;
pub(crate) const A63: Float = -3544.0 / 2565.0;
pub(crate) const A64: Float = 1859.0 / 4104.0;
pub(crate) const A65: Float = -11.0 / 40.0;

// 5th-order update weights (stage 2 drops out).
pub(crate) const B1: Float = 16.0 / 135.0;
pub(crate) const B3: Float = 6656.0 / 12825.0;
pub(crate) const B4: Float = 28561.0 / 56430.0;
pub(crate) const B5: Float = -9.0 / 50.0;
pub(crate) const B6: Float = 2.0 / 55.0;

// Difference between the 5th- and embedded 4th-order weights.
pub(crate) const E1: Float = 16.0 / 135.0 - 25.0 / 216.0;
pub(crate) const E3: Float = 6656.0 / 12825.0 - 1408.0 / 2565.0;
pub(crate) const E4: Float = 28561.0 / 56430.0 - 2197.0 / 4104.0;
pub(crate) const E5: Float = -9.0 / 50.0 + 1.0 / 5.0;
pub(crate) const E6: Float = 2.0 / 55.0;

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl OdeSystem for Decay {
        fn rhs(&self, _t: Float, _p: &[Float], y: &[Float], dydt: &mut [Float]) {
            dydt[0] = -y[0];
        }
    }

    struct LinearDrive;

    impl OdeSystem for LinearDrive {
        fn rhs(&self, t: Float, _p: &[Float], y: &[Float], dydt: &mut [Float]) {
            dydt[0] = 5.0 * t - 3.0 * y[0];
        }
    }

    #[test]
    fn single_step_matches_analytic_solution() {
        // y' = 5t - 3y, y(0) = 0 has y(t) = 5t/3 - 5/9 + (5/9) e^(-3t).
        let y = [0.0];
        let mut y1 = [0.0];
        let mut err = [0.0];
        let mut ws = StageScratch::new(1);
        rkf45_step(&LinearDrive, 0.0, &[], &y, 0.1, &mut y1, &mut err, &mut ws);
        let exact = 5.0 * 0.1 / 3.0 - 5.0 / 9.0 + (5.0 / 9.0) * (-0.3_f64).exp();
        assert!((y1[0] - exact).abs() < 1e-7, "y1 = {}, exact = {}", y1[0], exact);
        assert!(err[0] > 0.0 && err[0] < 1e-5);
    }

    #[test]
    fn exponential_decay_to_t_one() {
        let opts = SolverOptions::default();
        let mut y = [1.0];
        let (code, counters) = integrate(&Decay, 0.0, 1.0, &[], &mut y, &opts, None);
        assert!(code.is_success());
        assert!((y[0] - (-1.0_f64).exp()).abs() < 1e-6);
        assert!(counters.nsteps <= 20, "nsteps = {}", counters.nsteps);
        assert!(counters.niters >= counters.nsteps);
    }

    #[test]
    fn zero_length_interval_is_a_noop() {
        let opts = SolverOptions::default();
        let mut y = [0.75];
        let (code, counters) = integrate(&Decay, 2.0, 2.0, &[], &mut y, &opts, None);
        assert!(code.is_success());
        assert_eq!(y[0], 0.75);
        assert_eq!(counters.niters, 0);
        assert_eq!(counters.nsteps, 0);
    }

    #[test]
    fn oversized_initial_step_is_rejected_then_recovered() {
        let opts = SolverOptions::builder().h_init(0.9).build();
        let mut y = [1.0];
        let (code, counters) = integrate(&Decay, 0.0, 1.0, &[], &mut y, &opts, None);
        assert!(code.is_success());
        assert!(counters.niters > counters.nsteps, "no rejection happened");
        assert!((y[0] - (-1.0_f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn step_cap_reports_too_much_work() {
        let opts = SolverOptions::builder().max_iters(3).build();
        let mut y = [1.0];
        let (code, counters) = integrate(&Decay, 0.0, 1.0, &[], &mut y, &opts, None);
        assert_eq!(code, ErrorCode::MaxStepsExceeded);
        assert_eq!(counters.niters, 3);
    }

    #[test]
    fn backward_integration() {
        let opts = SolverOptions::default();
        let mut y = [(-1.0_f64).exp()];
        let (code, _) = integrate(&Decay, 1.0, 0.0, &[], &mut y, &opts, None);
        assert!(code.is_success());
        assert!((y[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn accepted_steps_are_logged() {
        let opts = SolverOptions::default();
        let mut y = [1.0];
        let mut records = Vec::new();
        let (code, counters) =
            integrate(&Decay, 0.0, 1.0, &[], &mut y, &opts, Some(&mut records));
        assert!(code.is_success());
        assert_eq!(records.len(), counters.nsteps);
        // Times are strictly increasing and end at t_end.
        for w in records.windows(2) {
            assert!(w[1].0 > w[0].0);
        }
        let (t_last, y_last) = records.last().unwrap().clone();
        assert!((t_last - 1.0).abs() <= UROUND);
        assert_eq!(y_last[0], y[0]);
    }
}
