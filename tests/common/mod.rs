//! Shared test problems.

#![allow(dead_code)]

use batchode::prelude::*;

/// Van der Pol oscillator with the stiffness parameter mu carried per IVP:
/// y0' = y1, y1' = mu (1 - y0^2) y1 - y0.
pub struct VanDerPol;

impl OdeSystem for VanDerPol {
    fn rhs(&self, _t: f64, p: &[f64], y: &[f64], dydt: &mut [f64]) {
        dydt[0] = y[1];
        dydt[1] = p[0] * (1.0 - y[0] * y[0]) * y[1] - y[0];
    }

    fn jac(&self, _t: f64, p: &[f64], y: &[f64], dfdy: &mut [f64]) {
        // Column-major 2x2.
        dfdy[0] = 0.0;
        dfdy[1] = -2.0 * p[0] * y[0] * y[1] - 1.0;
        dfdy[2] = 1.0;
        dfdy[3] = p[0] * (1.0 - y[0] * y[0]);
    }
}

/// Exponential decay y' = -k y with the rate constant as the parameter.
pub struct Decay;

impl OdeSystem for Decay {
    fn rhs(&self, _t: f64, p: &[f64], y: &[f64], dydt: &mut [f64]) {
        dydt[0] = -p[0] * y[0];
    }

    fn jac(&self, _t: f64, p: &[f64], _y: &[f64], dfdy: &mut [f64]) {
        dfdy[0] = -p[0];
    }
}

/// Reference state of the mu = 1 Van der Pol oscillator at t = 20 from
/// y(0) = (2, 0).
pub const VDP_REFERENCE: [f64; 2] = [2.00861986087015, -0.0659524608556108];
