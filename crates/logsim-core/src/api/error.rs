use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Fixed taxonomy of failures a call can end in.
///
/// `ApiError` carries the detail for each kind; `ErrorKind` is the bare
/// discriminant, handy for telemetry and for matching without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ErrorKind {
    Network,
    Timeout,
    Unauthorized,
    Forbidden,
    Validation,
    Business,
    ServerFault,
}

/// One field-level error from a 422 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct FieldError {
    #[serde(deserialize_with = "loc_parts")]
    pub loc: Vec<String>,
    pub msg: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl FieldError {
    /// The field this error is bound to, e.g. `port` for `["body", "port"]`.
    pub fn field(&self) -> Option<&str> {
        self.loc.last().map(String::as_str)
    }
}

/// Location entries are usually strings but array indices arrive as numbers.
fn loc_parts<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|part| match part {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unauthorized - session may be expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Validation failed: {message}")]
    Validation {
        /// Message of the first listed field error.
        message: String,
        fields: Vec<FieldError>,
    },

    #[error("{0}")]
    Business(String),

    #[error("Server error: {detail}")]
    ServerFault { status: Option<u16>, detail: String },
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Timeout => ErrorKind::Timeout,
            ApiError::Unauthorized => ErrorKind::Unauthorized,
            ApiError::Forbidden(_) => ErrorKind::Forbidden,
            ApiError::Validation { .. } => ErrorKind::Validation,
            ApiError::Business(_) => ErrorKind::Business,
            ApiError::ServerFault { .. } => ErrorKind::ServerFault,
        }
    }

    /// Network and timeout failures may succeed if the caller tries again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Timeout)
    }

    /// Per-field errors for form binding; empty for every other kind.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ApiError::Validation { fields, .. } => fields,
            _ => &[],
        }
    }

    /// Single line suitable for a toast or status bar.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Network(_) | ApiError::Timeout => {
                "Network error, please check your connection or try again later.".to_string()
            }
            ApiError::Unauthorized => "Your session has expired. Please log in again.".to_string(),
            ApiError::Forbidden(_) => "You do not have permission to do that.".to_string(),
            ApiError::Validation { message, .. } => message.clone(),
            ApiError::Business(message) => message.clone(),
            ApiError::ServerFault { .. } => {
                "The server encountered an error. Please try again later.".to_string()
            }
        }
    }
}
