//! User-supplied ODE system.

use crate::{Float, UROUND};

/// User-supplied right-hand side and Jacobian of a batch of IVPs.
///
/// One implementation serves every IVP in a batch; the per-IVP parameter
/// bundle `p` (rate constants, pressure, density, ...) is passed through
/// unchanged and distinguishes the lanes. Both methods must be pure: the
/// step controller retries rejected steps and will re-invoke them with
/// identical arguments.
///
/// # Example
///
/// ```ignore
/// struct VanDerPol;
/// impl OdeSystem for VanDerPol {
///     fn rhs(&self, _t: f64, p: &[f64], y: &[f64], dydt: &mut [f64]) {
///         dydt[0] = y[1];
///         dydt[1] = p[0] * (1.0 - y[0] * y[0]) * y[1] - y[0];
///     }
/// }
/// ```
pub trait OdeSystem {
    /// Compute the derivative dydt at (t, y) with parameters p.
    fn rhs(&self, t: Float, p: &[Float], y: &[Float], dydt: &mut [Float]);

    /// Write the n-by-n Jacobian d(rhs)/dy at (t, y) into `dfdy` in
    /// column-major order: `dfdy[j * n + i] = d rhs_i / d y_j`.
    ///
    /// Only the stiff (Radau5) method uses the Jacobian. The default
    /// implementation forms it by one-sided finite differences of `rhs`
    /// (n + 1 evaluations); override it with the analytical Jacobian for
    /// large or sensitive systems.
    fn jac(&self, t: Float, p: &[Float], y: &[Float], dfdy: &mut [Float]) {
        let n = y.len();
        let mut f0 = vec![0.0; n];
        let mut f1 = vec![0.0; n];
        let mut yp = y.to_vec();
        self.rhs(t, p, y, &mut f0);
        let sqrt_eps = UROUND.sqrt();
        for j in 0..n {
            let dy = sqrt_eps * y[j].abs().max(1e-5);
            yp[j] = y[j] + dy;
            self.rhs(t, p, &yp, &mut f1);
            for i in 0..n {
                dfdy[j * n + i] = (f1[i] - f0[i]) / dy;
            }
            yp[j] = y[j];
        }
    }
}
