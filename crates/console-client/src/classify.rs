//! Response classification
//!
//! Maps a transport outcome (status + body) onto the error taxonomy. The
//! mapping is fixed by status code; the body only contributes the message,
//! the validation field map and the rate-limit hint.
//!
//! Backends phrase error bodies in a few shapes, all handled best-effort:
//! `{"message": ..}`, `{"detail": ..}`, `{"error": ..}` or
//! `{"error": {"message": ..}}`, and for validation either
//! `{"errors": {"field": ["msg"]}}` or a list of `{"loc": [..], "msg": ..}`
//! entries under `detail`.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;

use crate::error::{ApiError, FieldErrors, Result};

/// Location prefixes that name where a field lives rather than the field.
const LOCATION_PREFIXES: &[&str] = &["body", "query", "path", "header"];

/// Classify a response: the parsed payload for 2xx, a classified error otherwise.
pub fn classify(status: u16, body: &str) -> Result<Value> {
    classify_response(status, &HeaderMap::new(), body)
}

/// Like `classify`, also honouring a `Retry-After` header on 429.
pub fn classify_response(status: u16, headers: &HeaderMap, body: &str) -> Result<Value> {
    ensure_success(status, headers, body.as_bytes())?;
    Ok(parse_payload(body))
}

/// The status check behind `classify_response`, leaving a 2xx body untouched
/// so binary downloads are never decoded.
pub(crate) fn ensure_success(status: u16, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    Err(classify_failure(
        status,
        &String::from_utf8_lossy(body),
        retry_after_header(headers),
    ))
}

/// Parse a success body. Empty bodies become `null`; non-JSON bodies are
/// returned as a JSON string.
pub fn parse_payload(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Classify an unsuccessful status.
///
/// `retry_after_header` is used for 429 only when the body carries no hint.
pub fn classify_failure(status: u16, body: &str, retry_after_header: Option<u64>) -> ApiError {
    let json: Option<Value> = serde_json::from_str(body).ok();
    let message = extract_message(json.as_ref(), body).unwrap_or_else(|| default_message(status));

    match status {
        401 => ApiError::AuthenticationRequired { message },
        403 => ApiError::PermissionDenied { message },
        404 => ApiError::NotFound { message },
        422 => ApiError::ValidationFailed {
            message,
            field_errors: json.as_ref().map(extract_field_errors).unwrap_or_default(),
        },
        429 => ApiError::RateLimited {
            message,
            retry_after: json
                .as_ref()
                .and_then(body_retry_after)
                .or(retry_after_header),
        },
        503 => ApiError::ServiceUnavailable { message },
        500..=599 => ApiError::ServerError { status, message },
        400..=499 => ApiError::ClientError { status, message },
        _ => ApiError::InvalidResponse {
            message: format!("unexpected status {status}: {message}"),
        },
    }
}

/// Best-effort human message from an error body.
fn extract_message(json: Option<&Value>, raw: &str) -> Option<String> {
    if let Some(json) = json {
        if let Some(msg) = json.get("message").and_then(Value::as_str) {
            return Some(msg.to_string());
        }
        match json.get("detail") {
            Some(Value::String(msg)) => return Some(msg.clone()),
            Some(Value::Array(items)) => {
                let msgs: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(Value::as_str))
                    .collect();
                if !msgs.is_empty() {
                    return Some(msgs.join("; "));
                }
            }
            _ => {}
        }
        match json.get("error") {
            Some(Value::String(msg)) => return Some(msg.clone()),
            Some(Value::Object(obj)) => {
                if let Some(msg) = obj.get("message").and_then(Value::as_str) {
                    return Some(msg.to_string());
                }
            }
            _ => {}
        }
        return None;
    }

    // Plain-text bodies are used as-is when short; HTML error pages are not.
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.len() <= 200 && !trimmed.starts_with('<') {
        return Some(trimmed.to_string());
    }
    None
}

fn default_message(status: u16) -> String {
    match status {
        401 => "Authentication required".into(),
        403 => "You do not have permission to perform this action".into(),
        404 => "Resource not found".into(),
        422 => "Validation failed".into(),
        429 => "Too many requests".into(),
        500 => "Internal server error".into(),
        503 => "Service unavailable".into(),
        _ => format!("Request failed with status {status}"),
    }
}

/// Field-level messages from either supported validation body shape.
fn extract_field_errors(json: &Value) -> FieldErrors {
    let mut fields = FieldErrors::new();

    for key in ["errors", "field_errors"] {
        if let Some(Value::Object(map)) = json.get(key) {
            for (field, messages) in map {
                let entry = fields.entry(field.clone()).or_default();
                match messages {
                    Value::String(msg) => entry.push(msg.clone()),
                    Value::Array(items) => entry.extend(
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string),
                    ),
                    _ => {}
                }
            }
        }
    }

    if let Some(Value::Array(items)) = json.get("detail") {
        for item in items {
            let Some(msg) = item.get("msg").and_then(Value::as_str) else {
                continue;
            };
            let field = item
                .get("loc")
                .and_then(Value::as_array)
                .map(|loc| field_from_location(loc))
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| "__all__".to_string());
            fields.entry(field).or_default().push(msg.to_string());
        }
    }

    fields
}

/// `["body", "scope", 0, "host"]` becomes `scope.0.host`.
fn field_from_location(loc: &[Value]) -> String {
    let parts: Vec<String> = loc
        .iter()
        .enumerate()
        .filter_map(|(i, part)| match part {
            Value::String(s) if i == 0 && LOCATION_PREFIXES.contains(&s.as_str()) => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    parts.join(".")
}

fn body_retry_after(json: &Value) -> Option<u64> {
    let value = json.get("retry_after")?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f.ceil() as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Integer-seconds `Retry-After`. HTTP-date values are ignored.
fn retry_after_header(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
