use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;
use std::time::Duration;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::SessionError(e) => match e {
                SessionError::MalformedHandshake(_) => StatusCode::BAD_REQUEST,
                SessionError::MessageTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                SessionError::DuplicateUsername(_) => StatusCode::CONFLICT,
                SessionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Everything that can go wrong for a single chat session.
///
/// None of these ever escape the session that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Username is already taken: {0}")]
    DuplicateUsername(String),

    #[error("Message too long: {length} characters (max {max})")]
    MessageTooLong { length: usize, max: usize },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Read failed: {0}")]
    PeerRead(String),

    #[error("Write failed: {0}")]
    PeerWrite(String),

    #[error("Outbound queue saturated")]
    Evicted,

    #[error("Idle timeout after {0:?}")]
    IdleTimeout(Duration),
}

impl SessionError {
    /// Whether the session survives this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::MessageTooLong { .. } | SessionError::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::InternalError(_)));

        let config_err = config::ConfigError::NotFound(String::from("key not found"));
        let app_err: AppError = config_err.into();
        assert!(matches!(app_err, AppError::ConfigError(_)));

        let app_err: AppError = SessionError::Evicted.into();
        assert!(matches!(app_err, AppError::SessionError(SessionError::Evicted)));
    }

    #[test]
    fn test_error_status_codes() {
        let err = AppError::NotFound("alice".to_string());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = AppError::SessionError(SessionError::DuplicateUsername("alice".into()));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err = AppError::SessionError(SessionError::RateLimited {
            retry_after: Duration::from_secs(5),
        });
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let err = AppError::SessionError(SessionError::PeerRead("reset".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SessionError::MessageTooLong { length: 575, max: 574 }.is_recoverable());
        assert!(SessionError::RateLimited { retry_after: Duration::from_secs(1) }.is_recoverable());
        assert!(!SessionError::DuplicateUsername("bob".into()).is_recoverable());
        assert!(!SessionError::PeerWrite("broken pipe".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = AppError::SessionError(SessionError::MessageTooLong { length: 575, max: 574 });
        assert_eq!(
            err.to_string(),
            "Session error: Message too long: 575 characters (max 574)"
        );

        let err = AppError::NotFound("session bob".to_string());
        assert_eq!(err.to_string(), "Not found: session bob");
    }
}
