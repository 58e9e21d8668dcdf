//! Maps raw transport results onto the `ApiError` taxonomy.
//!
//! The backend wraps most responses in a uniform envelope:
//! `{ "success": bool, "data": ..., "errorMessage": string | FieldError[] }`.
//! A few routes (login, logout) bypass the envelope and return raw JSON.
//! Nothing outside this module looks at status codes or envelope shapes.

use serde::Deserialize;
use serde_json::Value;

use super::error::{ApiError, FieldError};

/// Normalized result of one call.
pub type Outcome = Result<Value, ApiError>;

/// What a `Transport` observed for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// Connection refused, DNS failure, TLS failure, broken body stream...
    Connect(String),
    Timeout,
    Response { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<ErrorMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorMessage {
    Fields(Vec<FieldError>),
    Text(String),
    Other(Value),
}

/// FastAPI's default error body, seen when a request never reaches the
/// envelope-wrapping route handler.
#[derive(Debug, Deserialize)]
struct DetailBody {
    detail: Detail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Detail {
    Fields(Vec<FieldError>),
    Text(String),
    Other(Value),
}

pub fn classify(raw: RawResult) -> Outcome {
    let (status, body) = match raw {
        RawResult::Connect(detail) => return Err(ApiError::Network(detail)),
        RawResult::Timeout => return Err(ApiError::Timeout),
        RawResult::Response { status, body } => (status, body),
    };

    if status == 401 {
        return Err(ApiError::Unauthorized);
    }

    let envelope = serde_json::from_str::<Envelope>(&body).ok();
    let detail = match envelope {
        Some(_) => None,
        None => serde_json::from_str::<DetailBody>(&body).ok().map(|d| d.detail),
    };

    if status == 403 {
        let message = envelope
            .as_ref()
            .and_then(envelope_message)
            .or_else(|| detail.as_ref().and_then(detail_message))
            .unwrap_or_else(|| ApiError::truncate_body(&body));
        return Err(ApiError::Forbidden(message));
    }

    if status == 422 {
        let fields = match (&envelope, &detail) {
            (Some(Envelope { error_message: Some(ErrorMessage::Fields(f)), .. }), _) => f.clone(),
            (None, Some(Detail::Fields(f))) => f.clone(),
            _ => Vec::new(),
        };
        if let Some(first) = fields.first() {
            return Err(ApiError::Validation {
                message: first.msg.clone(),
                fields,
            });
        }
    }

    match envelope {
        Some(env) if env.success => Ok(env.data),
        Some(env) => {
            let message = envelope_message(&env)
                .unwrap_or_else(|| format!("Request failed with status {}", status));
            Err(ApiError::Business(message))
        }
        None if (200..300).contains(&status) => Ok(raw_payload(&body)),
        None if status >= 500 => Err(ApiError::ServerFault {
            status: Some(status),
            detail: ApiError::truncate_body(&body),
        }),
        None => {
            let message = detail
                .as_ref()
                .and_then(detail_message)
                .unwrap_or_else(|| format!("Status {}: {}", status, ApiError::truncate_body(&body)));
            Err(ApiError::Business(message))
        }
    }
}

fn envelope_message(env: &Envelope) -> Option<String> {
    match env.error_message.as_ref()? {
        ErrorMessage::Text(s) if s.is_empty() => None,
        ErrorMessage::Text(s) => Some(s.clone()),
        ErrorMessage::Fields(fields) => fields.first().map(|f| f.msg.clone()),
        ErrorMessage::Other(Value::Null) => None,
        ErrorMessage::Other(other) => Some(other.to_string()),
    }
}

fn detail_message(detail: &Detail) -> Option<String> {
    match detail {
        Detail::Text(s) => Some(s.clone()),
        Detail::Fields(fields) => fields.first().map(|f| f.msg.clone()),
        Detail::Other(Value::Null) => None,
        Detail::Other(other) => Some(other.to_string()),
    }
}

/// Non-envelope success bodies: JSON when it parses, otherwise the text.
fn raw_payload(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}
