//! Error surfaces: construction-time validation and per-IVP exit codes.

use crate::Float;

/// Errors raised while validating integrator construction inputs.
///
/// These are programmer/configuration mistakes; they are reported before
/// any integration begins and never originate from the numerics.
#[derive(Debug, Clone)]
pub enum ConfigError {
    AtolMustBePositive(Float),
    RtolMustBePositive(Float),
    NeqMustBePositive,
    NumWorkersMustBePositive,
    MinItersMustBePositive,
    AdaptionLimitTooSmall(Float),
    VectorSizeNotPowerOfTwo(usize),
    BlockSizeNotPowerOfTwo(usize),
    BlockSizeSmallerThanVectorSize(usize, usize),
    VectorModeUnsupported(&'static str),
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::AtolMustBePositive(v) => {
                write!(f, "atol must be positive (got {})", v)
            }
            ConfigError::RtolMustBePositive(v) => {
                write!(f, "rtol must be positive (got {})", v)
            }
            ConfigError::NeqMustBePositive => write!(f, "neq must be positive"),
            ConfigError::NumWorkersMustBePositive => {
                write!(f, "num_workers must be positive")
            }
            ConfigError::MinItersMustBePositive => {
                write!(f, "min_iters must be positive")
            }
            ConfigError::AdaptionLimitTooSmall(v) => {
                write!(f, "adaption_limit must be > 1 (got {})", v)
            }
            ConfigError::VectorSizeNotPowerOfTwo(v) => {
                write!(f, "vector_size {} is not a power of 2", v)
            }
            ConfigError::BlockSizeNotPowerOfTwo(v) => {
                write!(f, "block_size {} is not a power of 2", v)
            }
            ConfigError::BlockSizeSmallerThanVectorSize(b, v) => {
                write!(f, "block_size {} is smaller than vector_size {}", b, v)
            }
            ConfigError::VectorModeUnsupported(m) => {
                write!(f, "vector_size > 1 is not supported by the {} method", m)
            }
            ConfigError::DimensionMismatch {
                what,
                expected,
                got,
            } => write!(
                f,
                "{} has wrong length (expected {}, got {})",
                what, expected, got
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Per-IVP exit code of a batch integration.
///
/// The batch call as a whole succeeds once construction-time validation
/// has passed; each IVP carries one of these codes and callers must
/// inspect them. Any code other than [`ErrorCode::Success`] leaves the
/// corresponding state vector poisoned (NaN in its first component) or
/// frozen at the last accepted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Integration reached `t_end`.
    Success = 0,
    /// Five consecutive LU decomposition failures.
    MaxConsecutiveErrorsExceeded = 1,
    /// The allowed number of step attempts was exceeded.
    MaxStepsExceeded = 2,
    /// Stepsize underflow: `h` shrank below the resolution of `t`.
    HPlusTEqualsH = 3,
    /// Newton iteration failed to converge at the minimum stepsize.
    MaxNewtonIterExceeded = 4,
    /// The integration interval is below twice the roundoff of `t`.
    TdistTooSmall = 5,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Success => write!(f, "success"),
            ErrorCode::MaxConsecutiveErrorsExceeded => {
                write!(f, "an error occured on too many consecutive integration steps")
            }
            ErrorCode::MaxStepsExceeded => {
                write!(f, "the allowed number of integration steps was exceeded")
            }
            ErrorCode::HPlusTEqualsH => {
                write!(f, "the stepsize 'h' was decreased such that h = t + h")
            }
            ErrorCode::MaxNewtonIterExceeded => {
                write!(f, "the allowed number of newton iteration steps was exceeded")
            }
            ErrorCode::TdistTooSmall => {
                write!(f, "the integration interval is too small to resolve")
            }
        }
    }
}
