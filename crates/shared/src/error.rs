use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    RateLimited,
    Internal,
    #[serde(other)]
    Unknown,
}

/// Error body returned by the analysis API on a non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default = "unknown_code")]
    pub code: ErrorCode,
    #[serde(alias = "detail")]
    pub message: String,
}

fn unknown_code() -> ErrorCode {
    ErrorCode::Unknown
}
