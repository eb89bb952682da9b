//! Compute API errors
//!
//! Errors are classified from the HTTP status and the structured `reason`
//! carried in the Google API error envelope, never from message text.

use serde_json::{json, Value};
use thiserror::Error;

/// Coarse classification of an [`ApiError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    AlreadyExists,
    Auth,
    RateLimited,
    Unavailable,
    Transport,
    Other,
}

/// Error returned by a call against the Compute REST API
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The request never produced an HTTP response
    #[error("request failed: {0}")]
    Transport(String),

    /// No access token could be obtained
    #[error("failed to obtain access token: {0}")]
    Auth(String),

    /// The API answered with a non-success status
    #[error("API request failed: {status} {}: {message}", reason.as_deref().unwrap_or("unknown"))]
    Status {
        status: u16,
        reason: Option<String>,
        message: String,
        body: Value,
    },

    /// The response body was not the JSON we expected
    #[error("failed to parse response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Build an error from a non-success response
    pub fn from_response(status: u16, body: &str) -> Self {
        let body: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        let error = body.get("error");

        let message = error
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // errors[].reason is the v1 detail; error.status is the newer enum name
        let reason = error
            .and_then(|e| e.get("errors"))
            .and_then(|v| v.as_array())
            .and_then(|errors| errors.first())
            .and_then(|first| first.get("reason"))
            .and_then(|v| v.as_str())
            .or_else(|| error.and_then(|e| e.get("status")).and_then(|v| v.as_str()))
            .map(str::to_string);

        Self::Status {
            status,
            reason,
            message,
            body,
        }
    }

    /// Build a status error shaped like a Google API error envelope
    pub fn status(status: u16, reason: &str, message: &str) -> Self {
        let body = json!({
            "error": {
                "code": status,
                "message": message,
                "errors": [{ "reason": reason, "message": message }]
            }
        });
        Self::Status {
            status,
            reason: Some(reason.to_string()),
            message: message.to_string(),
            body,
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::status(404, "notFound", message)
    }

    pub fn already_exists(message: &str) -> Self {
        Self::status(409, "alreadyExists", message)
    }

    /// HTTP status, if the API answered at all
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw error payload returned by the API
    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::Status { body, .. } if !body.is_null() => Some(body),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        let (status, reason) = match self {
            Self::Transport(_) => return ErrorCategory::Transport,
            Self::Auth(_) => return ErrorCategory::Auth,
            Self::Decode(_) => return ErrorCategory::Other,
            Self::Status { status, reason, .. } => (*status, reason.as_deref()),
        };

        match (status, reason) {
            (_, Some("notFound" | "NOT_FOUND")) | (404, None) => ErrorCategory::NotFound,
            (_, Some("alreadyExists" | "ALREADY_EXISTS")) | (409, None) => {
                ErrorCategory::AlreadyExists
            }
            (401 | 403, _) => ErrorCategory::Auth,
            (429, _) => ErrorCategory::RateLimited,
            (500 | 502 | 503 | 504, _) => ErrorCategory::Unavailable,
            (404, Some(_)) => ErrorCategory::NotFound,
            _ => ErrorCategory::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.category() == ErrorCategory::AlreadyExists
    }

    /// Operator-facing hint for this error
    pub fn hint(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Auth => {
                "Authentication or permission failure. Run 'gcloud auth application-default login' and check IAM roles."
            }
            ErrorCategory::NotFound => "Resource not found.",
            ErrorCategory::AlreadyExists => "Resource already exists.",
            ErrorCategory::RateLimited => "Rate limit exceeded. Re-run later.",
            ErrorCategory::Unavailable => "Compute API temporarily unavailable. Re-run later.",
            ErrorCategory::Transport => "Request failed. Check your network connection.",
            ErrorCategory::Other => "Request rejected. Check the error detail.",
        }
    }
}
