//! Error types for authorization operations
//!
//! Every mutation in this crate returns an [`AuthzError`] synchronously.
//! Permission checks never fail: an unknown user, role or permission simply
//! resolves to `false`.
//!
//! Idempotent operations (assigning a role the user already holds, revoking
//! one they don't, granting twice) succeed without an error. That is the
//! contract, not a swallowed failure.

use thiserror::Error;

/// Authorization error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthzError {
    /// Malformed role name, permission string, pattern or configuration value
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown role, permission, template or template version
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate registration or circular inheritance
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not allowed in the current state (e.g. deleting a system role)
    #[error("Invalid state: {0}")]
    State(String),
}

/// Result type for authorization operations.
pub type AuthzResult<T> = Result<T, AuthzError>;

impl AuthzError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        AuthzError::Validation(message.into())
    }

    pub(crate) fn not_found(kind: &str, name: &str) -> Self {
        AuthzError::NotFound(format!("{kind} '{name}'"))
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        AuthzError::Conflict(message.into())
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        AuthzError::State(message.into())
    }

    /// Get HTTP status code for this error.
    ///
    /// The engine itself has no transport; this is a convenience for the
    /// administrative layer that exposes it.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthzError::Validation(_) => 400,
            AuthzError::NotFound(_) => 404,
            AuthzError::Conflict(_) => 409,
            AuthzError::State(_) => 422,
        }
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthzError::Validation(_) => "VALIDATION_ERROR",
            AuthzError::NotFound(_) => "NOT_FOUND",
            AuthzError::Conflict(_) => "CONFLICT",
            AuthzError::State(_) => "INVALID_STATE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AuthzError::validation("x").error_code(), "VALIDATION_ERROR");
        assert_eq!(AuthzError::not_found("role", "x").status_code(), 404);
        assert_eq!(AuthzError::conflict("x").status_code(), 409);
        assert_eq!(AuthzError::state("x").error_code(), "INVALID_STATE");
    }

    #[test]
    fn test_not_found_message() {
        let err = AuthzError::not_found("role", "architect");
        assert_eq!(err.to_string(), "Not found: role 'architect'");
    }
}
