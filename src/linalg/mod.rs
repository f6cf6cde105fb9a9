//! Dense linear algebra: LU factorization and solves for the Newton
//! iteration matrices.

mod lu;

pub(crate) use lu::{lu_factor, lu_solve, LinScalar, Singular};
