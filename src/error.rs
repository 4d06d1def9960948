//! Error taxonomy for the composition core
//!
//! Classification failure is not an error (it is the `Invalid` outcome of
//! `validate`); these variants cover the remaining cases: contract
//! violations at setters, allocation failures, and hardware-capability
//! violations that degrade to the software fallback.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CompositionError {
    /// A setter received a value outside its contract (NaN, out of range).
    /// Prior state is retained unchanged.
    #[error("bad parameter for {field}: {reason}")]
    BadParameter {
        field: &'static str,
        reason: String,
    },

    /// A buffer or model resource could not be allocated; the operation
    /// is a no-op for this frame.
    #[error("resource allocation failed: {0}")]
    ResourceAllocation(String),

    /// An unexpected state reached a restricted hardware path; logged and
    /// degraded to the fallback, never fatal.
    #[error("hardware capability violation: {0}")]
    CapabilityViolation(String),
}
