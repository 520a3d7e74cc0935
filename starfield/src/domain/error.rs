//! Domain-level error types.
//!
//! These errors are transport agnostic. Foreground operations hand them to
//! the caller for display; background operations log them and carry on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ports::{IdentityProviderError, RemoteStoreError};

/// Stable machine-readable error code describing the failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A remote call failed in a way a later attempt may not.
    TransientRemoteFailure,
    /// The actor may not perform this action (ban, non-owner moderation).
    PermissionDenied,
    /// The advisory capacity check failed.
    CapacityExceeded,
    /// A multi-step operation stopped part way; earlier steps were kept.
    PartialSequenceFailure,
    /// The request is malformed or fails validation.
    InvalidRequest,
    /// The referenced room, participant or ban does not exist.
    NotFound,
    /// No session, or the session credential was rejected.
    Unauthorized,
    /// An unexpected error occurred inside the domain.
    InternalError,
}

/// Domain error payload.
///
/// ## Invariants
/// - `message` must be non-empty once trimmed of whitespace.
///
/// # Examples
/// ```
/// use starfield::domain::{Error, ErrorCode};
///
/// let err = Error::capacity_exceeded("room is full");
/// assert_eq!(err.code(), ErrorCode::CapacityExceeded);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
#[serde(try_from = "ErrorDto", into = "ErrorDto")]
pub struct Error {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

/// Validation errors emitted by the constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorValidationError {
    EmptyMessage,
}

impl std::fmt::Display for ErrorValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "error message must not be empty"),
        }
    }
}

impl std::error::Error for ErrorValidationError {}

impl Error {
    /// Create a new error; an empty message is replaced by the code name.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        match Self::try_new(code, message) {
            Ok(value) => value,
            Err(ErrorValidationError::EmptyMessage) => Self {
                code,
                message: format!("{code:?}"),
                details: None,
            },
        }
    }

    /// Fallible constructor that validates the message content.
    pub fn try_new(code: ErrorCode, message: impl Into<String>) -> Result<Self, ErrorValidationError> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(ErrorValidationError::EmptyMessage);
        }
        Ok(Self {
            code,
            message,
            details: None,
        })
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Supplementary structured details.
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// Attach structured details to the error.
    ///
    /// # Examples
    /// ```
    /// use serde_json::json;
    /// use starfield::domain::Error;
    ///
    /// let err = Error::partial_sequence_failure("membership insert failed")
    ///     .with_details(json!({ "step": "insert_membership" }));
    /// assert!(err.details().is_some());
    /// ```
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convenience constructor for [`ErrorCode::TransientRemoteFailure`].
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransientRemoteFailure, message)
    }

    /// Convenience constructor for [`ErrorCode::PermissionDenied`].
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    /// Convenience constructor for [`ErrorCode::CapacityExceeded`].
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CapacityExceeded, message)
    }

    /// Convenience constructor for [`ErrorCode::PartialSequenceFailure`].
    pub fn partial_sequence_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PartialSequenceFailure, message)
    }

    /// Convenience constructor for [`ErrorCode::InvalidRequest`].
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Convenience constructor for [`ErrorCode::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Convenience constructor for [`ErrorCode::Unauthorized`].
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Convenience constructor for [`ErrorCode::InternalError`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<RemoteStoreError> for Error {
    fn from(error: RemoteStoreError) -> Self {
        let kind = error.kind();
        let mapped = match &error {
            RemoteStoreError::Unauthorized { .. } => Self::unauthorized(error.to_string()),
            RemoteStoreError::NotFound { .. } => Self::not_found(error.to_string()),
            RemoteStoreError::Rejected { .. } => Self::invalid_request(error.to_string()),
            RemoteStoreError::Connection { .. } | RemoteStoreError::Procedure { .. } => {
                Self::transient(error.to_string())
            }
        };
        mapped.with_details(serde_json::json!({ "storeError": kind }))
    }
}

impl From<IdentityProviderError> for Error {
    fn from(error: IdentityProviderError) -> Self {
        match error {
            IdentityProviderError::NoSession => Self::unauthorized(error.to_string()),
            IdentityProviderError::Unavailable { .. } => Self::transient(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDto {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl From<Error> for ErrorDto {
    fn from(value: Error) -> Self {
        Self {
            code: value.code,
            message: value.message,
            details: value.details,
        }
    }
}

impl TryFrom<ErrorDto> for Error {
    type Error = ErrorValidationError;

    fn try_from(value: ErrorDto) -> Result<Self, Self::Error> {
        let ErrorDto {
            code,
            message,
            details,
        } = value;

        let mut error = Error::try_new(code, message)?;
        error.details = details;
        Ok(error)
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn try_new_rejects_blank_messages() {
        assert_eq!(
            Error::try_new(ErrorCode::NotFound, "   "),
            Err(ErrorValidationError::EmptyMessage)
        );
    }

    #[rstest]
    fn new_falls_back_to_code_name() {
        let err = Error::new(ErrorCode::PermissionDenied, "");
        assert_eq!(err.message(), "PermissionDenied");
    }

    #[rstest]
    #[case(RemoteStoreError::connection("reset"), ErrorCode::TransientRemoteFailure)]
    #[case(RemoteStoreError::procedure("boom"), ErrorCode::TransientRemoteFailure)]
    #[case(RemoteStoreError::unauthorized("expired"), ErrorCode::Unauthorized)]
    #[case(RemoteStoreError::not_found("room"), ErrorCode::NotFound)]
    #[case(RemoteStoreError::rejected("unique"), ErrorCode::InvalidRequest)]
    fn store_errors_map_to_codes(#[case] error: RemoteStoreError, #[case] expected: ErrorCode) {
        let kind = error.kind();
        let mapped = Error::from(error);
        assert_eq!(mapped.code(), expected);
        assert_eq!(mapped.details(), Some(&json!({ "storeError": kind })));
    }

    #[rstest]
    fn serialises_with_snake_case_codes() {
        let err = Error::capacity_exceeded("room is full");
        let value = serde_json::to_value(&err).expect("serialise error");
        assert_eq!(value, json!({ "code": "capacity_exceeded", "message": "room is full" }));
    }

    #[rstest]
    fn deserialisation_rejects_blank_messages() {
        let result = serde_json::from_value::<Error>(json!({ "code": "not_found", "message": " " }));
        assert!(result.is_err());
    }
}
