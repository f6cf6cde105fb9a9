//! Startup heuristic for the initial stepsize.

use crate::{
    error::ErrorCode,
    methods::common::wnorm,
    ode::OdeSystem,
    Float, UROUND,
};

/// Estimate an initial stepsize from a crude second-derivative probe.
///
/// Geometric mean of the stepsize bounds as a trial `hg`, one forward
/// difference of the RHS along `y + hg * y'` to estimate `y''`, then the
/// step that keeps the predicted second-order term near unity. A single
/// refinement pass is intentional.
///
/// `f0` must hold the RHS at `(t, y)`, `sc` the inverse error weights for
/// `y`. The returned stepsize carries the sign of `t_end - t`.
pub(crate) fn hinit<F: OdeSystem>(
    f: &F,
    t: Float,
    t_end: Float,
    p: &[Float],
    y: &[Float],
    f0: &[Float],
    sc: &[Float],
    min_iters: usize,
    ytmp: &mut [Float],
    ftmp: &mut [Float],
) -> Result<Float, ErrorCode> {
    let n = y.len();
    let tdist = (t_end - t).abs();
    let tround = UROUND * t.abs().max(t_end.abs());
    if tdist < 2.0 * tround {
        return Err(ErrorCode::TdistTooSmall);
    }
    let posneg = (t_end - t).signum();

    let hlb = 100.0 * UROUND * tdist;
    let hub = tdist / min_iters as Float;
    if hlb >= hub {
        return Err(ErrorCode::TdistTooSmall);
    }
    let hg = (hlb * hub).sqrt();

    // Probe y'' by differencing the RHS across an explicit Euler step of hg.
    for i in 0..n {
        ytmp[i] = y[i] + hg * posneg * f0[i];
    }
    f.rhs(t + hg * posneg, p, ytmp, ftmp);
    for i in 0..n {
        ftmp[i] = (ftmp[i] - f0[i]) / (hg * posneg);
    }
    let yddnrm = wnorm(sc, ftmp);

    let hnew = if yddnrm * hub * hub > 2.0 {
        (2.0 / yddnrm).sqrt()
    } else {
        (hg * hub).sqrt()
    };

    Ok((0.5 * hnew).clamp(hlb, hub) * posneg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::common::scale_init;

    struct Decay;

    impl OdeSystem for Decay {
        fn rhs(&self, _t: Float, _p: &[Float], y: &[Float], dydt: &mut [Float]) {
            dydt[0] = -y[0];
        }
    }

    #[test]
    fn startup_step_is_within_bounds() {
        let y = [1.0];
        let mut f0 = [0.0];
        Decay.rhs(0.0, &[], &y, &mut f0);
        let mut sc = [0.0];
        scale_init(1e-10, 1e-6, &y, &mut sc);
        let mut ytmp = [0.0];
        let mut ftmp = [0.0];
        let h = hinit(&Decay, 0.0, 1.0, &[], &y, &f0, &sc, 1, &mut ytmp, &mut ftmp).unwrap();
        assert!(h > 0.0);
        assert!(h >= 100.0 * UROUND);
        assert!(h <= 1.0);
    }

    #[test]
    fn backward_interval_gives_negative_step() {
        let y = [1.0];
        let mut f0 = [0.0];
        Decay.rhs(1.0, &[], &y, &mut f0);
        let mut sc = [0.0];
        scale_init(1e-10, 1e-6, &y, &mut sc);
        let mut ytmp = [0.0];
        let mut ftmp = [0.0];
        let h = hinit(&Decay, 1.0, 0.0, &[], &y, &f0, &sc, 1, &mut ytmp, &mut ftmp).unwrap();
        assert!(h < 0.0);
    }

    #[test]
    fn degenerate_interval_is_fatal() {
        let y = [1.0];
        let f0 = [-1.0];
        let sc = [1.0];
        let mut ytmp = [0.0];
        let mut ftmp = [0.0];
        let err = hinit(
            &Decay,
            1.0,
            1.0 + UROUND,
            &[],
            &y,
            &f0,
            &sc,
            1,
            &mut ytmp,
            &mut ftmp,
        )
        .unwrap_err();
        assert_eq!(err, ErrorCode::TdistTooSmall);
    }
}
