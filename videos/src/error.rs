//! Error boundary for callers exposing the library over a protocol.
//!
//! [`ApiError`] maps domain errors to a status class and a user-facing
//! message. Server errors keep their detail out of the message; it is logged
//! when the error is built.

use crate::library::LibraryError;
use std::fmt;

/// A caller-facing error: status code, stable code string, safe message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: u16,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// 404 Not Found.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    /// 409 Conflict.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: 409,
            code: "CONFLICT",
            message: message.into(),
        }
    }

    /// 422 Unprocessable Entity.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: 422,
            code: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    /// 500 Internal Server Error with a generic message.
    #[must_use]
    pub fn internal() -> Self {
        Self {
            status: 500,
            code: "INTERNAL_SERVER_ERROR",
            message: "Internal server error".to_string(),
        }
    }

    /// HTTP status code.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Stable error code for clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    /// User-facing message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<LibraryError> for ApiError {
    fn from(error: LibraryError) -> Self {
        if error.is_conflict() {
            return Self::conflict(error.to_string());
        }
        if error.is_not_found() {
            return Self::not_found(error.to_string());
        }
        match error {
            LibraryError::InvalidInput(message) => Self::validation(message),
            other => {
                tracing::error!(error = %other, "Internal server error");
                Self::internal()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventline_core::event_store::EventStoreError;
    use eventline_core::stream::{StreamId, Version};

    #[test]
    fn conflicts_map_to_409() {
        let lost_update = LibraryError::from(EventStoreError::ConcurrencyConflict {
            stream_id: StreamId::new("video-1"),
            expected: Version::new(1),
            actual: Version::new(2),
        });
        let taken =
            LibraryError::from(EventStoreError::StreamAlreadyExists(StreamId::new("video-1")));

        assert_eq!(ApiError::from(lost_update).status(), 409);
        assert_eq!(ApiError::from(taken).status(), 409);
    }

    #[test]
    fn missing_stream_maps_to_404() {
        let missing = LibraryError::from(EventStoreError::StreamNotFound(StreamId::new("user-9")));
        let error = ApiError::from(missing);
        assert_eq!(error.status(), 404);
        assert_eq!(error.code(), "NOT_FOUND");
    }

    #[test]
    fn storage_failures_hide_their_detail() {
        let failure = LibraryError::from(EventStoreError::DatabaseError(
            "password authentication failed for user postgres".to_string(),
        ));
        let error = ApiError::from(failure);

        assert_eq!(error.status(), 500);
        assert!(!error.message().contains("postgres"));
    }

    #[test]
    fn invalid_input_keeps_its_message() {
        let error = ApiError::from(LibraryError::InvalidInput("title must not be blank".into()));
        assert_eq!(error.status(), 422);
        assert_eq!(error.message(), "title must not be blank");
    }
}
