//! Error Types - Gangway Core Error Handling
//!
//! Provides the error taxonomy shared by all Gangway crates: invalid
//! arguments, malformed environment variables, ambiguous device
//! configurations, and collective-communication failures.
//!
//! # Key Features
//! - Unified error type for all Gangway operations
//! - Messages name the offending parameter/variable and its actual vs
//!   expected value, so failures stay diagnosable in multi-process launches
//! - Integration with `std::error::Error`
//!
//! @version 0.2.0
//! @author Gangway Development Team

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for Gangway operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A caller supplied structurally invalid input. Always raised before
    /// any collective call is issued.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid input.
        message: String,
    },

    /// A configuration environment variable has an unparsable or
    /// out-of-range value.
    #[error("The value of the `{var}` environment variable {expected}, but is '{value}' instead")]
    InvalidEnvironment {
        /// The name of the offending variable.
        var: String,
        /// The actual value of the variable.
        value: String,
        /// The expected value or range.
        expected: String,
    },

    /// Automatic device selection cannot determine a unique device.
    #[error("Ambiguous configuration: {message}")]
    AmbiguousConfiguration {
        /// Description of the ambiguity.
        message: String,
    },

    /// The default process group was bootstrapped twice without opting
    /// into reuse.
    #[error("The default process group is already initialized")]
    AlreadyInitialized,

    /// The operation has no meaning for this gang variant.
    #[error("Unsupported operation: {message}")]
    UnsupportedOperation {
        /// Description of why the operation is unsupported.
        message: String,
    },

    /// A blocking collective exceeded its configured timeout. Terminal;
    /// no retry is attempted at this layer.
    #[error("The collective `{operation}` operation timed out after {timeout:?}")]
    CollectiveTimeout {
        /// The collective operation that timed out.
        operation: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// A transport-level communication failure.
    #[error("Communication error: {message}")]
    Communication {
        /// Description of the communication failure.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}; please file a bug report")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

// =============================================================================
// Result Type
// =============================================================================

/// A specialized Result type for Gangway operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Helper Functions
// =============================================================================

impl Error {
    /// Creates a new invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new invalid environment variable error.
    #[must_use]
    pub fn invalid_env(
        var: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidEnvironment {
            var: var.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Creates a new ambiguous configuration error.
    #[must_use]
    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::AmbiguousConfiguration {
            message: message.into(),
        }
    }

    /// Creates a new unsupported operation error.
    #[must_use]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
        }
    }

    /// Creates a new communication error.
    #[must_use]
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
