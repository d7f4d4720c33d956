//! Error types for the RL core library

use thiserror::Error;

/// Core error type for RL operations
#[derive(Error, Debug)]
pub enum RLError {
    /// Invalid configuration, raised at construction time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Action space kind that the requested component cannot handle
    #[error("Unsupported action space: {0}")]
    UnsupportedActionSpace(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Size the receiver requires
        expected: usize,
        /// Size that was supplied
        actual: usize,
    },

    /// A call-site precondition does not hold
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Derived state accessed before the phase that produces it
    #[error("{operation} requires phase {required}, current phase is {current}")]
    InvalidPhase {
        /// Operation that was attempted
        operation: String,
        /// Minimum phase the operation needs
        required: String,
        /// Phase the component was in
        current: String,
    },

    /// Algorithm path that exists but is not wired up yet
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Algorithm path that the component will never support
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid action
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Policy-related errors
    #[error("Policy error: {0}")]
    Policy(String),

    /// Environment-related errors
    #[error("Environment error: {0}")]
    Environment(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// Tensor shape error
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RLError {
    /// Build an [`RLError::InvalidPhase`] from anything displayable
    pub fn invalid_phase(
        operation: impl Into<String>,
        required: impl std::fmt::Display,
        current: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidPhase {
            operation: operation.into(),
            required: required.to_string(),
            current: current.to_string(),
        }
    }
}

/// Result type alias for RL operations
pub type Result<T> = std::result::Result<T, RLError>;
