//! Error types for the signon client

use thiserror::Error;

/// Application error codes reported by the identity service.
///
/// The service returns a short uppercase code next to a human-readable
/// message. Components pattern-match on the codes they understand; anything
/// else is carried through as `Other` and rendered generically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// Password was accepted but a second factor is required
    TotpRequired,
    /// An account with this email already exists
    EmailExists,
    /// Any code outside the known set
    Other(String),
}

impl ErrorCode {
    pub fn from_wire(code: &str) -> Self {
        match code {
            "TOTP_REQUIRED" => ErrorCode::TotpRequired,
            "EMAIL_EXISTS" => ErrorCode::EmailExists,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::TotpRequired => "TOTP_REQUIRED",
            ErrorCode::EmailExists => "EMAIL_EXISTS",
            ErrorCode::Other(code) => code,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the authentication client
#[derive(Debug, Error)]
pub enum AuthError {
    /// Transport-level failure; the message is the underlying error verbatim
    #[error("Network error: {0}")]
    Network(String),

    /// The service rejected the operation with an application error code
    #[error("{message}")]
    Application { code: ErrorCode, message: String },

    /// A payload could not be decoded; callers treat this as absent data
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid client setup, reported before any request is issued
    #[error("Configuration error: {0}")]
    Config(String),

    /// Keyring or credential-file failure
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// The sign-in window flow could not run or was abandoned
    #[error("Sign-in window error: {0}")]
    Popup(String),

    /// An operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl AuthError {
    /// Build an application error from the wire code and message
    pub fn application(code: &str, message: impl Into<String>) -> Self {
        AuthError::Application {
            code: ErrorCode::from_wire(code),
            message: message.into(),
        }
    }

    /// The application error code, when this is an application error
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            AuthError::Application { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Map the error category to a process exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            AuthError::Config(_) => 1,
            AuthError::Network(_) => 2,
            AuthError::Application { .. } => 3,
            AuthError::Timeout(_) => 4,
            AuthError::Decode(_) | AuthError::Storage(_) | AuthError::Popup(_) => 5,
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Timeout(err.to_string())
        } else {
            AuthError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        AuthError::Storage(err.to_string())
    }
}
