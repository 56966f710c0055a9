use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Malformed status response: {message}")]
    MalformedResponse { message: String },
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ValidationError { .. } => "validation",
            GatewayError::NetworkError { .. } => "network",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::HttpError { .. } => "http",
            GatewayError::MalformedResponse { .. } => "malformed_response",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("invalid payment record: {0}")]
    InvalidRecord(String),
}
