//! Error types for the Blend65 compiler
//!
//! User-facing problems (bad source code) flow through the diagnostics
//! collector and never surface as `Error` values. The variants here cover
//! hard failures: malformed configuration, pipeline aborts after a phase
//! reported errors, and internal compiler errors that indicate bugs.

use thiserror::Error;

/// Blend65 compiler errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The pipeline stopped at a phase boundary because the phase reported
    /// errors; the details live in the accompanying diagnostics.
    #[error("Compilation failed in {phase}: {count} error(s)")]
    CompilationFailed {
        /// Phase that reported the errors
        phase: String,
        /// Number of errors accumulated
        count: usize,
    },

    /// Malformed compiler configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SSA verification failure (compiler bug)
    #[error("SSA verification failed in function '{function}': {reason}")]
    SsaVerification {
        /// Function whose SSA form is malformed
        function: String,
        /// What the verifier rejected
        reason: String,
        /// Textual dump of the offending function
        dump: String,
    },

    /// IL validation failure (compiler bug)
    #[error("IL validation failed in function '{function}': {reason}")]
    IlValidation {
        /// Function whose IL is malformed
        function: String,
        /// What the validator rejected
        reason: String,
    },

    /// The code generator met an opcode it cannot lower for the target
    #[error("Unsupported IL opcode '{opcode}' for target at {location}")]
    UnsupportedOpcode {
        /// Name of the opcode
        opcode: String,
        /// Source location attached to the instruction
        location: String,
    },

    /// General internal error (compiler bug)
    #[error("Internal compiler error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error with a message
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Does this error indicate a compiler bug rather than bad input?
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::SsaVerification { .. }
                | Error::IlValidation { .. }
                | Error::UnsupportedOpcode { .. }
                | Error::Internal(_)
        )
    }
}

/// Result type for Blend65 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_classification() {
        assert!(Error::internal("oops").is_internal());
        assert!(!Error::CompilationFailed {
            phase: "parse".to_string(),
            count: 2,
        }
        .is_internal());
    }

    #[test]
    fn test_display() {
        let err = Error::UnsupportedOpcode {
            opcode: "Phi".to_string(),
            location: "main.bl65:3:1".to_string(),
        };
        assert!(err.to_string().contains("Phi"));
    }
}
