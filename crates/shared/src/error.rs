use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
    Unexpected,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 409 | 422 => Self::Validation,
            429 => Self::RateLimited,
            500..=599 => Self::Internal,
            _ => Self::Unexpected,
        }
    }
}

/// Classified non-2xx answer from the offers API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
}

impl ApiError {
    /// Picks the most specific message the body offers, falling back to the
    /// bare status line.
    pub fn from_response(status: u16, body: &Value) -> Self {
        let message = ["/message", "/error/message", "/error", "/data/message"]
            .iter()
            .filter_map(|pointer| body.pointer(pointer))
            .find_map(|value| value.as_str().map(str::to_owned))
            .or_else(|| body.as_str().filter(|text| !text.is_empty()).map(str::to_owned))
            .unwrap_or_else(|| format!("HTTP error! status: {status}"));

        Self {
            code: ErrorCode::from_status(status),
            status,
            message,
        }
    }
}
