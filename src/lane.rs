//! Lock-step execution of the Fehlberg 4(5) pair across a group of IVP
//! lanes.
//!
//! A group of `v` IVPs advances through the same instruction stream with
//! per-lane data: states live in component-major structure-of-arrays form
//! (`y[k * v + l]` for component k of lane l), every stepsize decision is a
//! per-lane mask, and every conditional update commits through
//! `select(mask, new, old)`. A lane group only exits when every member is
//! done; individual IVPs never leave early, they simply stop committing.

use crate::{
    error::ErrorCode,
    methods::{
        common::{scale_init, Counters},
        hinit::hinit,
        rkf45::{
            A21, A31, A32, A41, A42, A43, A51, A52, A53, A54, A61, A62, A63, A64, A65, B1, B3,
            B4, B5, B6, C2, C3, C4, C6, E1, E3, E4, E5, E6, ERR_SAFETY,
        },
    },
    ode::OdeSystem,
    options::SolverOptions,
    Float, UROUND,
};

/// Masked commit: `new` where the lane mask is set, `old` otherwise.
#[inline]
fn select(mask: bool, new: Float, old: Float) -> Float {
    if mask { new } else { old }
}

/// Copy lane `l` out of a structure-of-arrays buffer.
fn lane_gather(src: &[Float], v: usize, l: usize, dst: &mut [Float]) {
    for k in 0..dst.len() {
        dst[k] = src[k * v + l];
    }
}

/// Copy a per-lane vector back into a structure-of-arrays buffer.
fn lane_scatter(src: &[Float], v: usize, l: usize, dst: &mut [Float]) {
    for k in 0..src.len() {
        dst[k * v + l] = src[k];
    }
}

fn lane_params(params: &[Float], m: usize, l: usize) -> &[Float] {
    &params[l * m..(l + 1) * m]
}

/// Integrate `v` IVPs in lock step with masked per-lane accept/reject.
///
/// `y` is the component-major state block of the group; `params` holds one
/// `m`-long parameter bundle per lane, lane-contiguous. Lanes at index
/// `active` and beyond are padding (the driver fills them with copies of a
/// real lane) and are masked off from the first iteration.
pub(crate) fn integrate_lockstep<F: OdeSystem>(
    f: &F,
    v: usize,
    active: usize,
    n: usize,
    m: usize,
    t0: &[Float],
    t_end: &[Float],
    params: &[Float],
    y: &mut [Float],
    opts: &SolverOptions,
    mut logs: Option<&mut [Vec<(Float, Vec<Float>)>]>,
) -> Vec<(ErrorCode, Counters)> {
    let np = n * v;
    let mut k1 = vec![0.0; np];
    let mut k2 = vec![0.0; np];
    let mut k3 = vec![0.0; np];
    let mut k4 = vec![0.0; np];
    let mut k5 = vec![0.0; np];
    let mut k6 = vec![0.0; np];
    let mut ytmp = vec![0.0; np];
    let mut y5 = vec![0.0; np];
    let mut errv = vec![0.0; np];
    // Per-lane scalar working set.
    let mut ybuf = vec![0.0; n];
    let mut fbuf = vec![0.0; n];
    let mut sbuf = vec![0.0; n];
    let mut gbuf = vec![0.0; n];
    let mut wbuf = vec![0.0; n];

    let mut t = t0.to_vec();
    let mut h = vec![0.0; v];
    let mut posneg = vec![0.0; v];
    let mut roundoff = vec![0.0; v];
    let mut hmin = vec![0.0; v];
    let mut hmax = vec![0.0; v];
    let mut done = vec![false; v];
    let mut step = vec![false; v];
    let mut accept = vec![false; v];
    let mut herr = vec![0.0; v];
    let mut code = vec![ErrorCode::Success; v];
    let mut counters = vec![Counters::default(); v];

    // Per-lane startup: bounds, then the initial stepsize.
    for l in 0..v {
        if l >= active {
            done[l] = true;
            continue;
        }
        let tdist = (t_end[l] - t[l]).abs();
        if tdist == 0.0 {
            done[l] = true;
            continue;
        }
        // The landing tolerance honours both the interval roundoff and the
        // resolution of t_end itself.
        roundoff[l] = UROUND * tdist.max(t_end[l].abs());
        posneg[l] = (t_end[l] - t[l]).signum();
        hmin[l] = 100.0 * UROUND * tdist;
        hmax[l] = tdist / opts.min_iters as Float;
        if hmin[l] >= hmax[l] {
            code[l] = ErrorCode::TdistTooSmall;
            done[l] = true;
            continue;
        }
        h[l] = if opts.h_init.abs() > hmin[l] {
            opts.h_init.abs().min(hmax[l]) * posneg[l]
        } else {
            lane_gather(y, v, l, &mut ybuf);
            f.rhs(t[l], lane_params(params, m, l), &ybuf, &mut fbuf);
            scale_init(opts.atol, opts.rtol, &ybuf, &mut wbuf);
            match hinit(
                f,
                t[l],
                t_end[l],
                lane_params(params, m, l),
                &ybuf,
                &fbuf,
                &wbuf,
                opts.min_iters,
                &mut sbuf,
                &mut gbuf,
            ) {
                Ok(h0) => h0,
                Err(c) => {
                    code[l] = c;
                    done[l] = true;
                    continue;
                }
            }
        };
    }

    while !done.iter().all(|&d| d) {
        // Per-lane attempt masks: lanes that exhaust their budgets or
        // underflow their stepsize become done here and stop committing.
        for l in 0..v {
            step[l] = !done[l];
            if !step[l] {
                continue;
            }
            if opts.max_iters > 0 && counters[l].niters >= opts.max_iters {
                code[l] = ErrorCode::MaxStepsExceeded;
                done[l] = true;
                step[l] = false;
                continue;
            }
            if 0.1 * h[l].abs() <= t[l].abs() * UROUND {
                code[l] = ErrorCode::HPlusTEqualsH;
                done[l] = true;
                step[l] = false;
                continue;
            }
            // Land exactly on t_end when the remaining span is within reach.
            let remaining = t_end[l] - t[l];
            if (t[l] + h[l] - t_end[l]) * posneg[l] > 0.0 || (remaining - h[l]).abs() <= hmin[l]
            {
                h[l] = remaining;
            }
            counters[l].niters += 1;
        }
        if step.iter().all(|&s| !s) {
            continue;
        }

        // Six Fehlberg stages, lifted across the lane group.
        for l in 0..v {
            if step[l] {
                lane_gather(y, v, l, &mut ybuf);
                f.rhs(t[l], lane_params(params, m, l), &ybuf, &mut fbuf);
                lane_scatter(&fbuf, v, l, &mut k1);
            }
        }
        for k in 0..n {
            for l in 0..v {
                let i = k * v + l;
                ytmp[i] = y[i] + h[l] * A21 * k1[i];
            }
        }
        for l in 0..v {
            if step[l] {
                lane_gather(&ytmp, v, l, &mut ybuf);
                f.rhs(t[l] + C2 * h[l], lane_params(params, m, l), &ybuf, &mut fbuf);
                lane_scatter(&fbuf, v, l, &mut k2);
            }
        }
        for k in 0..n {
            for l in 0..v {
                let i = k * v + l;
                ytmp[i] = y[i] + h[l] * (A31 * k1[i] + A32 * k2[i]);
            }
        }
        for l in 0..v {
            if step[l] {
                lane_gather(&ytmp, v, l, &mut ybuf);
                f.rhs(t[l] + C3 * h[l], lane_params(params, m, l), &ybuf, &mut fbuf);
                lane_scatter(&fbuf, v, l, &mut k3);
            }
        }
        for k in 0..n {
            for l in 0..v {
                let i = k * v + l;
                ytmp[i] = y[i] + h[l] * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
            }
        }
        for l in 0..v {
            if step[l] {
                lane_gather(&ytmp, v, l, &mut ybuf);
                f.rhs(t[l] + C4 * h[l], lane_params(params, m, l), &ybuf, &mut fbuf);
                lane_scatter(&fbuf, v, l, &mut k4);
            }
        }
        for k in 0..n {
            for l in 0..v {
                let i = k * v + l;
                ytmp[i] =
                    y[i] + h[l] * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
            }
        }
        for l in 0..v {
            if step[l] {
                lane_gather(&ytmp, v, l, &mut ybuf);
                f.rhs(t[l] + h[l], lane_params(params, m, l), &ybuf, &mut fbuf);
                lane_scatter(&fbuf, v, l, &mut k5);
            }
        }
        for k in 0..n {
            for l in 0..v {
                let i = k * v + l;
                ytmp[i] = y[i]
                    + h[l]
                        * (A61 * k1[i]
                            + A62 * k2[i]
                            + A63 * k3[i]
                            + A64 * k4[i]
                            + A65 * k5[i]);
            }
        }
        for l in 0..v {
            if step[l] {
                lane_gather(&ytmp, v, l, &mut ybuf);
                f.rhs(t[l] + C6 * h[l], lane_params(params, m, l), &ybuf, &mut fbuf);
                lane_scatter(&fbuf, v, l, &mut k6);
            }
        }
        for k in 0..n {
            for l in 0..v {
                let i = k * v + l;
                y5[i] = y[i]
                    + h[l] * (B1 * k1[i] + B3 * k3[i] + B4 * k4[i] + B5 * k5[i] + B6 * k6[i]);
                errv[i] = (h[l]
                    * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i]))
                    .abs();
            }
        }

        // Weighted error norm and acceptance mask per lane.
        for l in 0..v {
            if !step[l] {
                accept[l] = false;
                continue;
            }
            let mut sum = 0.0;
            for k in 0..n {
                let i = k * v + l;
                let sc = 1.0 / (opts.atol + y[i].abs().max(y5[i].abs()) * opts.rtol);
                let e = sc * errv[i];
                sum += e * e;
            }
            herr[l] = (sum / n as Float).sqrt().max(1e-10);
            accept[l] = herr[l] <= 1.0 || h[l].abs() <= hmin[l];
        }

        // Masked commits: state, time, counters, log.
        for k in 0..n {
            for l in 0..v {
                let i = k * v + l;
                y[i] = select(accept[l], y5[i], y[i]);
            }
        }
        for l in 0..v {
            t[l] = select(accept[l], t[l] + h[l], t[l]);
            if accept[l] {
                counters[l].nsteps += 1;
                if let Some(records) = logs.as_deref_mut() {
                    lane_gather(y, v, l, &mut ybuf);
                    records[l].push((t[l], ybuf.clone()));
                }
            }
        }
        for l in 0..v {
            if step[l] {
                let fact = (ERR_SAFETY * herr[l].powf(-0.25))
                    .clamp(1.0 / opts.adaption_limit, opts.adaption_limit);
                h[l] = (h[l].abs() * fact).clamp(hmin[l], hmax[l]) * posneg[l];
                if (t_end[l] - t[l]) * posneg[l] <= roundoff[l] {
                    done[l] = true;
                }
            }
        }
    }

    code.into_iter().zip(counters).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::rkf45;

    struct Decay;

    impl OdeSystem for Decay {
        fn rhs(&self, _t: Float, p: &[Float], y: &[Float], dydt: &mut [Float]) {
            dydt[0] = -p[0] * y[0];
        }
    }

    struct Sho;

    impl OdeSystem for Sho {
        fn rhs(&self, _t: Float, _p: &[Float], y: &[Float], dydt: &mut [Float]) {
            dydt[0] = y[1];
            dydt[1] = -y[0];
        }
    }

    #[test]
    fn lanes_match_scalar_execution() {
        let opts = SolverOptions::default();
        let rates = [0.5, 1.0, 2.0, 4.0];
        // Lock-step group of four decay problems.
        let mut yv = vec![1.0; 4];
        let t0 = vec![0.0; 4];
        let te = vec![1.0; 4];
        let results =
            integrate_lockstep(&Decay, 4, 4, 1, 1, &t0, &te, &rates, &mut yv, &opts, None);
        for (l, rate) in rates.iter().enumerate() {
            assert!(results[l].0.is_success());
            // The same IVP run scalar, one lane at a time.
            let mut ys = [1.0];
            let (c, counters) =
                rkf45::integrate(&Decay, 0.0, 1.0, &[*rate], &mut ys, &opts, None);
            assert!(c.is_success());
            assert!(
                (yv[l] - ys[0]).abs() <= 1e-12,
                "lane {} diverged: {} vs {}",
                l,
                yv[l],
                ys[0]
            );
            assert_eq!(results[l].1, counters);
        }
    }

    #[test]
    fn multi_component_lanes() {
        let opts = SolverOptions::default();
        let half_pi = std::f64::consts::FRAC_PI_2;
        // Two oscillators, one of them a padding copy.
        let t0 = vec![0.0; 2];
        let te = vec![half_pi; 2];
        // SoA layout: y0 of both lanes, then y1 of both lanes.
        let mut yv = vec![1.0, 1.0, 0.0, 0.0];
        let results =
            integrate_lockstep(&Sho, 2, 1, 2, 0, &t0, &te, &[], &mut yv, &opts, None);
        assert!(results[0].0.is_success());
        assert!((yv[0] - 0.0).abs() < 1e-5);
        assert!((yv[2] - (-1.0)).abs() < 1e-5);
        // The padding lane never commits.
        assert_eq!(yv[1], 1.0);
        assert_eq!(yv[3], 0.0);
        assert_eq!(results[1].1, Counters::default());
    }

    #[test]
    fn degenerate_lane_fails_alone() {
        let opts = SolverOptions::default();
        let t0 = vec![0.0, 1.0];
        let te = vec![1.0, 1.0 + UROUND];
        let rates = [1.0, 1.0];
        let mut yv = vec![1.0, 0.7];
        let results =
            integrate_lockstep(&Decay, 2, 2, 1, 1, &t0, &te, &rates, &mut yv, &opts, None);
        assert!(results[0].0.is_success());
        assert!((yv[0] - (-1.0_f64).exp()).abs() < 1e-6);
        assert_eq!(results[1].0, ErrorCode::TdistTooSmall);
        assert_eq!(yv[1], 0.7);
    }
}
