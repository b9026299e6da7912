use thiserror::Error;

/// Type alias for Result with CleanerError
pub type Result<T> = std::result::Result<T, CleanerError>;

/// Error types for the session, task and batch layers
#[derive(Error, Debug)]
pub enum CleanerError {
    /// Authorization handshake failed, timed out or was rejected.
    /// The handshake has to be restarted from the beginning.
    #[error("Authorization failed: {0}")]
    AuthorizationError(String),

    /// No usable session, the caller must (re)authenticate
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// The refresh token was revoked or rejected by the provider
    #[error("Credential rejected by provider: {0}")]
    InvalidGrant(String),

    /// Credential persistence failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// A task of the same kind is already running
    #[error("Task '{kind}' is already running")]
    Conflict { kind: String },

    /// A single remote item failed inside a batch
    #[error("Item {id} failed: {reason}")]
    RemoteItem { id: String, reason: String },

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Gmail API returned an error that fits no other class
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Request parameters rejected before any remote call
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// User cancelled operation
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Task journal errors
    #[error("State error: {0}")]
    StateError(String),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CleanerError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CleanerError::RateLimitExceeded { .. }
                | CleanerError::ServerError { .. }
                | CleanerError::NetworkError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Seconds the remote side asked us to wait, if any
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            CleanerError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short machine-readable code, recorded in per-item failure records
    pub fn code(&self) -> &'static str {
        match self {
            CleanerError::AuthorizationError(_) => "authorization_failed",
            CleanerError::NotAuthenticated(_) => "not_authenticated",
            CleanerError::InvalidGrant(_) => "invalid_grant",
            CleanerError::StorageError(_) => "storage_error",
            CleanerError::Conflict { .. } => "conflict",
            CleanerError::RemoteItem { .. } => "item_failed",
            CleanerError::RateLimitExceeded { .. } => "rate_limited",
            CleanerError::NetworkError(_) => "network_error",
            CleanerError::ServerError { .. } => "server_error",
            CleanerError::MessageNotFound(_) => "not_found",
            CleanerError::BadRequest(_) => "bad_request",
            CleanerError::Forbidden(_) => "forbidden",
            CleanerError::ApiError(_) => "api_error",
            CleanerError::InvalidMessageFormat(_) => "invalid_message",
            CleanerError::ValidationError(_) => "invalid_request",
            CleanerError::OperationCancelled(_) => "cancelled",
            CleanerError::IoError(_) => "io_error",
            CleanerError::SerializationError(_) => "serialization_error",
            CleanerError::ConfigError(_) => "config_error",
            CleanerError::StateError(_) => "state_error",
            CleanerError::Unknown(_) => "unknown",
        }
    }

    /// Status code a route layer should answer with for this error
    pub fn http_status(&self) -> u16 {
        match self {
            CleanerError::NotAuthenticated(_) | CleanerError::InvalidGrant(_) => 401,
            CleanerError::Forbidden(_) => 403,
            CleanerError::MessageNotFound(_) => 404,
            CleanerError::Conflict { .. } => 409,
            CleanerError::RateLimitExceeded { .. } => 429,
            CleanerError::ValidationError(_) | CleanerError::BadRequest(_) => 400,
            CleanerError::AuthorizationError(_) | CleanerError::NetworkError(_) => 502,
            _ => 500,
        }
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing or invalid,
/// returns a default of 5 seconds.
pub(crate) fn parse_retry_after(headers: &hyper::HeaderMap) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    let Some(value) = headers
        .get(hyper::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
    else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return seconds;
    }

    httpdate::parse_http_date(value)
        .ok()
        .and_then(|at| at.duration_since(std::time::SystemTime::now()).ok())
        .map(|d| d.as_secs())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Map an HTTP status returned by Google into an error class
pub(crate) fn classify_status(status: u16, retry_after: u64, message: String) -> CleanerError {
    match status {
        401 => CleanerError::NotAuthenticated(message),
        403 if message.to_lowercase().contains("quota") => {
            CleanerError::RateLimitExceeded { retry_after }
        }
        403 => CleanerError::Forbidden(message),
        404 => CleanerError::MessageNotFound(message),
        400 => CleanerError::BadRequest(message),
        429 => CleanerError::RateLimitExceeded { retry_after },
        500..=599 => CleanerError::ServerError { status, message },
        _ => CleanerError::ApiError(message),
    }
}

impl From<google_gmail1::Error> for CleanerError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let message = format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                );
                classify_status(status.as_u16(), parse_retry_after(response.headers()), message)
            }
            google_gmail1::Error::BadRequest(ref err) => {
                CleanerError::BadRequest(format!("{}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                CleanerError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => CleanerError::NetworkError(err.to_string()),
            _ => CleanerError::ApiError(error.to_string()),
        }
    }
}
