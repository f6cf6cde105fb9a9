//! Solver configuration: method selection, state layout, and options.

use bon::Builder;

use crate::{error::ConfigError, Float};

/// Integration method selection.
///
/// Further kinds (exponential integrators, stabilized RK, high-order
/// embedded pairs) are extension points and hang off this enum when they
/// land.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// Embedded Runge–Kutta–Fehlberg 4(5), adaptive, non-stiff.
    Rkf45,
    /// 3-stage Radau IIA (order 5), implicit, stiff.
    Radau5,
}

impl Method {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Method::Rkf45 => "rkf45",
            Method::Radau5 => "radau5",
        }
    }
}

/// Memory layout of the packed state matrix across IVPs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    /// `y[ivp * neq + k]`: one IVP's state is contiguous.
    RowMajor,
    /// `y[k * num + ivp]`: one component is contiguous across IVPs.
    ColMajor,
}

/// Options for a batch integrator, immutable for the life of a run.
///
/// All fields have defaults, so `SolverOptions::builder().build()` is a
/// valid starting point.
#[derive(Builder, Clone, Debug)]
pub struct SolverOptions {
    /// Absolute tolerance for error estimation.
    #[builder(default = 1e-10)]
    pub atol: Float,
    /// Relative tolerance for error estimation.
    #[builder(default = 1e-6)]
    pub rtol: Float,
    /// Initial stepsize hint. Values at or below the minimum stepsize are
    /// replaced by the startup heuristic.
    #[builder(default = 0.0)]
    pub h_init: Float,
    /// Maximum number of step attempts per IVP; 0 disables the cap.
    #[builder(default = 100_000)]
    pub max_iters: usize,
    /// Floor on the number of steps, fixing the maximum stepsize as
    /// `|t_end - t0| / min_iters`.
    #[builder(default = 1)]
    pub min_iters: usize,
    /// Clamp on the per-step growth/shrink ratio of `h` (RKF45).
    #[builder(default = 4.0)]
    pub adaption_limit: Float,
    /// If true, every accepted step is appended to the integrator log.
    #[builder(default = false)]
    pub logging: bool,
    /// Layout of the packed state matrix handed to `integrate`.
    #[builder(default = Order::RowMajor)]
    pub order: Order,
    /// Lock-step lane width; a power of two. Widths above 1 run groups of
    /// IVPs in lock step with masked accept/reject (RKF45 only).
    #[builder(default = 1)]
    pub vector_size: usize,
    /// Accelerator work-group size hint; a power of two, at least
    /// `vector_size`. Validated and carried, unused by the CPU driver.
    #[builder(default = 1)]
    pub block_size: usize,
    /// Accelerator grid size hint; 0 lets the device decide.
    #[builder(default = 0)]
    pub num_blocks: usize,
    /// Pull IVP indices from a shared atomic counter instead of static
    /// chunks, balancing uneven per-IVP work across workers.
    #[builder(default = true)]
    pub use_queue: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions::builder().build()
    }
}

impl SolverOptions {
    /// Validate the option bundle for the given method, accumulating every
    /// problem found.
    pub(crate) fn validate(&self, method: Method) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if !(self.atol > 0.0) {
            errors.push(ConfigError::AtolMustBePositive(self.atol));
        }
        if !(self.rtol > 0.0) {
            errors.push(ConfigError::RtolMustBePositive(self.rtol));
        }
        if self.min_iters == 0 {
            errors.push(ConfigError::MinItersMustBePositive);
        }
        if !(self.adaption_limit > 1.0) {
            errors.push(ConfigError::AdaptionLimitTooSmall(self.adaption_limit));
        }
        if !self.vector_size.is_power_of_two() {
            errors.push(ConfigError::VectorSizeNotPowerOfTwo(self.vector_size));
        }
        if !self.block_size.is_power_of_two() {
            errors.push(ConfigError::BlockSizeNotPowerOfTwo(self.block_size));
        }
        if self.block_size < self.vector_size {
            errors.push(ConfigError::BlockSizeSmallerThanVectorSize(
                self.block_size,
                self.vector_size,
            ));
        }
        if self.vector_size > 1 && method != Method::Rkf45 {
            errors.push(ConfigError::VectorModeUnsupported(method.name()));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let opts = SolverOptions::builder().build();
        assert_eq!(opts.atol, 1e-10);
        assert_eq!(opts.rtol, 1e-6);
        assert_eq!(opts.max_iters, 100_000);
        assert_eq!(opts.min_iters, 1);
        assert_eq!(opts.order, Order::RowMajor);
        assert_eq!(opts.vector_size, 1);
        assert!(opts.use_queue);
        assert!(!opts.logging);
        assert!(opts.validate(Method::Rkf45).is_empty());
        assert!(opts.validate(Method::Radau5).is_empty());
    }

    #[test]
    fn rejects_bad_sizes() {
        let opts = SolverOptions::builder().vector_size(3).block_size(2).build();
        let errors = opts.validate(Method::Rkf45);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::VectorSizeNotPowerOfTwo(3))));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::BlockSizeSmallerThanVectorSize(2, 3))));
    }

    #[test]
    fn rejects_vector_radau() {
        let opts = SolverOptions::builder().vector_size(4).block_size(4).build();
        let errors = opts.validate(Method::Radau5);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::VectorModeUnsupported(_))));
        assert!(opts.validate(Method::Rkf45).is_empty());
    }

    #[test]
    fn rejects_nonpositive_tolerances() {
        let opts = SolverOptions::builder().atol(0.0).rtol(-1.0).build();
        let errors = opts.validate(Method::Rkf45);
        assert_eq!(errors.len(), 2);
    }
}
