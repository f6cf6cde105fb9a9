//! Convenient prelude: import the most commonly used traits and types.
//!
//! Bring this into scope with:
//!
//! ```rust
//! use batchode::prelude::*;
//! ```

pub use crate::{
    ConfigError, Counters, ErrorCode, Integrator, IvpResult, LogRecord, Method, OdeSystem,
    Order, SolverOptions,
};
