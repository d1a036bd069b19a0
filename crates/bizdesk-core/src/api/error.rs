use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// The credential was rejected and could not be renewed. The session has
    /// already been ended; callers should send the user to sign in again.
    #[error("Session expired - please sign in again")]
    SessionExpired,

    #[error("{message} (status {status})")]
    Request { status: StatusCode, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request body: {0}")]
    InvalidRequest(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// The backend issued a credential but the store would not keep it, so
    /// no session was started.
    #[error("Could not save credential: {0}")]
    CredentialStorage(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = Self::message_from_body(body)
            .unwrap_or_else(|| Self::default_message(status));
        ApiError::Request { status, message }
    }

    /// Extract a human-readable message from an error body shaped either as a
    /// bare JSON string or as an object with a `message` field.
    fn message_from_body(body: &str) -> Option<String> {
        let message = match serde_json::from_str::<Value>(body).ok()? {
            Value::String(s) => s,
            Value::Object(map) => match map.get("message") {
                Some(Value::String(s)) => s.clone(),
                _ => return None,
            },
            _ => return None,
        };
        let message = message.trim();
        (!message.is_empty()).then(|| Self::truncate_body(message))
    }

    fn default_message(status: StatusCode) -> String {
        let text = match status.as_u16() {
            400 => "Bad request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Resource not found",
            409 => "Conflict",
            422 => "Validation failed",
            429 => "Too many requests",
            500 => "Internal server error",
            502 => "Bad gateway",
            503 => "Service unavailable",
            504 => "Gateway timeout",
            code => return format!("Request failed with status {}", code),
        };
        text.to_string()
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Request { status, .. } => Some(*status),
            ApiError::Network(e) => e.status(),
            _ => None,
        }
    }
}
