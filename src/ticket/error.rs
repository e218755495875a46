//! Error types for ticket issuance, validation and storage.

use thiserror::Error;

/// Failures surfaced to validating services.
///
/// Every variant carries the human-readable description returned in the
/// failure document; `code()` gives the wire code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidTicketSpec(String),

    #[error("{0}")]
    InvalidTicket(String),

    #[error("{0}")]
    InvalidService(String),

    #[error("{0}")]
    BadPgt(String),

    #[error("{0}")]
    InternalError(String),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidRequest(_) => "INVALID_REQUEST",
            ValidationError::InvalidTicketSpec(_) => "INVALID_TICKET_SPEC",
            ValidationError::InvalidTicket(_) => "INVALID_TICKET",
            ValidationError::InvalidService(_) => "INVALID_SERVICE",
            ValidationError::BadPgt(_) => "BAD_PGT",
            ValidationError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for this failure.
    pub fn status(&self) -> u16 {
        status_for_code(self.code())
    }
}

/// `INVALID_*` and `BAD_PGT` are unprocessable; everything else is internal.
pub fn status_for_code(code: &str) -> u16 {
    if code.starts_with("INVALID_") || code == "BAD_PGT" {
        422
    } else {
        500
    }
}

/// Errors raised by a ticket store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis operation failed: {0}")]
    RedisError(String),

    #[error("Failed to (de)serialize ticket record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ticket store is unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::RedisError(e.to_string())
    }
}

impl From<StoreError> for ValidationError {
    fn from(e: StoreError) -> Self {
        log::error!("Ticket store failure: {}", e);
        ValidationError::InternalError(format!("Ticket store failure: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ValidationError::InvalidRequest(String::new()).status(), 422);
        assert_eq!(ValidationError::InvalidTicketSpec(String::new()).status(), 422);
        assert_eq!(ValidationError::InvalidTicket(String::new()).status(), 422);
        assert_eq!(ValidationError::InvalidService(String::new()).status(), 422);
        assert_eq!(ValidationError::BadPgt(String::new()).status(), 422);
        assert_eq!(ValidationError::InternalError(String::new()).status(), 500);
        assert_eq!(status_for_code("SOMETHING_ELSE"), 500);
    }

    #[test]
    fn test_store_error_becomes_internal() {
        let err: ValidationError = StoreError::Unavailable("down".to_string()).into();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
