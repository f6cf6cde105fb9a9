//! batchode: batched adaptive integration of independent initial value problems.
//!
//! This crate solves large ensembles of independent IVPs y' = f(t, y; p),
//! y(t0) = y0, that share one right-hand side but differ in state and
//! parameters — the shape of chemical-kinetics source terms, where thousands
//! of cells each carry their own thermochemical state.
//!
//! Highlights
//! - Methods: RKF45 (embedded Fehlberg 4(5), non-stiff workhorse) and
//!   Radau5 (3-stage Radau IIA, order 5, stiff workhorse with simplified
//!   Newton iteration and Jacobian/LU reuse)
//! - Batch driver: worker threads with static or atomic-queue assignment,
//!   plus lock-step vector lanes with masked per-IVP accept/reject
//! - Controls: `atol`, `rtol`, `h_init`, `max_iters`, `min_iters`,
//!   `adaption_limit`, state layout (`order`), lane width (`vector_size`)
//! - Per-IVP exit codes and step/iteration counters; optional accepted-step
//!   log
//!
//! Quick start
//! ```rust,no_run
//! use batchode::prelude::*;
//!
//! struct Decay;
//! impl OdeSystem for Decay {
//!     fn rhs(&self, _t: f64, p: &[f64], y: &[f64], dydt: &mut [f64]) {
//!         dydt[0] = -p[0] * y[0];
//!     }
//! }
//!
//! fn main() {
//!     let options = SolverOptions::builder().rtol(1e-6).atol(1e-10).build();
//!     let solver = Integrator::new(Method::Rkf45, 1, 4, options).unwrap();
//!
//!     // Two IVPs with different rate constants, packed row-major.
//!     let p = [1.0, 2.0];
//!     let mut y = [1.0, 1.0];
//!     let results = solver.integrate(&Decay, 2, 0.0, 1.0, &p, &mut y).unwrap();
//!     for (i, r) in results.iter().enumerate() {
//!         println!("ivp {i}: code {:?}, y = {}", r.code, y[i]);
//!     }
//! }
//! ```
//!
//! A batch call itself only fails on configuration errors; numerical
//! failures (step-count exhaustion, repeated decomposition failure,
//! stepsize underflow) are reported per IVP through [`ErrorCode`] and must
//! be inspected by the caller.

mod driver;
mod error;
mod lane;
mod linalg;
mod methods;
mod ode;
mod options;

pub mod prelude;

pub use driver::{Integrator, IvpResult, LogRecord};
pub use error::{ConfigError, ErrorCode};
pub use methods::common::Counters;
pub use ode::OdeSystem;
pub use options::{Method, Order, SolverOptions};

// Prevent selecting two incompatible float precision features at once.
#[cfg(all(feature = "f32", feature = "f64"))]
compile_error!(
    "features 'f32' and 'f64' cannot both be enabled; pick exactly one Float precision feature"
);

/// Change this to f64 or f32 as desired.
#[cfg(feature = "f32")]
pub(crate) type Float = f32;
#[cfg(feature = "f64")]
pub(crate) type Float = f64;

/// Machine precision for the selected Float.
pub(crate) const UROUND: Float = Float::EPSILON;
