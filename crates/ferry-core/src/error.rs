//! Error types for ferry operations.
//!
//! Errors carry a structured [`ErrorCode`] and map onto the pipeline's
//! error taxonomy through [`FerryError::kind`]. Retry decisions are made from
//! [`FerryError::is_retryable`]; nothing else in the crate inspects messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ferry operations.
pub type FerryResult<T> = Result<T, FerryError>;

/// Main error type for all ferry operations.
#[derive(Error, Debug)]
pub enum FerryError {
    /// Configuration is missing or invalid. Fatal before a run starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The provider rejected our credentials. Fatal for that source-account.
    #[error("Authentication error: {message}")]
    Authentication {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Request budget exhausted, either locally or signalled by the provider.
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        code: ErrorCode,
        retry_after: Option<u64>,
    },

    /// Transport failure or a 5xx from the provider.
    #[error("Network error: {message}")]
    Network {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The provider answered with a response we cannot use (non-retryable 4xx).
    #[error("Provider error: {message}")]
    Provider { message: String, code: ErrorCode },

    /// An attachment could not be fetched; the message itself is still kept.
    #[error("Media download failed for '{filename}': {message}")]
    PartialMediaDownload { filename: String, message: String },

    /// Writing to the output tree failed.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Dedup index operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An operation did not complete before its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Provider payload could not be decoded.
    #[error("Parse error: {message}")]
    Parse { message: String, code: ErrorCode },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Authentication (AUTH_xxx)
    AuthInvalidCredentials,
    AuthExpiredToken,
    AuthMissingCredentials,

    // Rate Limit (RATE_xxx)
    RateLimitExceeded,
    RateLimitBudgetTimeout,

    // Network (NET_xxx)
    NetTimeout,
    NetConnectionFailed,
    NetServerError,

    // Provider (PRV_xxx)
    PrvBadRequest,
    PrvNotFound,

    // Storage (STO_xxx)
    StoWriteFailed,
    StoDirectoryFailed,

    // Database (DB_xxx)
    DbConnectionFailed,
    DbOperationFailed,

    // Parse (PARSE_xxx)
    ParseInvalidJson,
    ParseInvalidMime,
    ParseMissingField,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthInvalidCredentials => "AUTH_001",
            ErrorCode::AuthExpiredToken => "AUTH_002",
            ErrorCode::AuthMissingCredentials => "AUTH_003",
            ErrorCode::RateLimitExceeded => "RATE_001",
            ErrorCode::RateLimitBudgetTimeout => "RATE_002",
            ErrorCode::NetTimeout => "NET_001",
            ErrorCode::NetConnectionFailed => "NET_002",
            ErrorCode::NetServerError => "NET_003",
            ErrorCode::PrvBadRequest => "PRV_001",
            ErrorCode::PrvNotFound => "PRV_002",
            ErrorCode::StoWriteFailed => "STO_001",
            ErrorCode::StoDirectoryFailed => "STO_002",
            ErrorCode::DbConnectionFailed => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::ParseInvalidJson => "PARSE_001",
            ErrorCode::ParseInvalidMime => "PARSE_002",
            ErrorCode::ParseMissingField => "PARSE_003",
            ErrorCode::Internal => "INT_001",
        }
    }
}

/// Taxonomy bucket an error falls into, as reported in run results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    RateLimit,
    Network,
    /// The provider was reached but refused the request.
    Provider,
    PartialMediaDownload,
    Storage,
    Timeout,
    Parse,
    Internal,
}

impl FerryError {
    /// Create an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            code: ErrorCode::AuthInvalidCredentials,
            source: None,
        }
    }

    /// Create an authentication error for credentials that were never supplied.
    pub fn missing_credentials(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            code: ErrorCode::AuthMissingCredentials,
            source: None,
        }
    }

    /// Create a rate limit error.
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit {
            message: message.into(),
            code: ErrorCode::RateLimitExceeded,
            retry_after: None,
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            code: ErrorCode::NetConnectionFailed,
            source: None,
        }
    }

    /// Create a network error that keeps its underlying cause.
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            code: ErrorCode::NetConnectionFailed,
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            code: ErrorCode::StoWriteFailed,
            source: None,
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            source: None,
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            code: ErrorCode::ParseInvalidJson,
        }
    }

    /// Create a media download error.
    pub fn media(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PartialMediaDownload {
            filename: filename.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Authentication { code, .. } => *code,
            Self::RateLimit { code, .. } => *code,
            Self::Network { code, .. } => *code,
            Self::Provider { code, .. } => *code,
            Self::Storage { code, .. } => *code,
            Self::Database { code, .. } => *code,
            Self::Parse { code, .. } => *code,
            Self::Timeout(_) => ErrorCode::NetTimeout,
            _ => ErrorCode::Internal,
        }
    }

    /// Taxonomy bucket for result reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Network { .. } => ErrorKind::Network,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::PartialMediaDownload { .. } => ErrorKind::PartialMediaDownload,
            Self::Storage { .. } | Self::Io(_) => ErrorKind::Storage,
            Self::Database { .. } => ErrorKind::Storage,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Parse { .. } | Self::Serialization(_) => ErrorKind::Parse,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a backoff retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Waiting for a local slot already took the whole budget.
            Self::RateLimit { code, .. } => *code != ErrorCode::RateLimitBudgetTimeout,
            Self::Network { .. } | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Seconds the provider asked us to wait, if it said so.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Map a non-success HTTP status from a provider.
    ///
    /// `context` names the call site; response bodies are kept out of the
    /// message since providers sometimes echo request parameters.
    pub fn from_http_status(status: u16, context: &str, retry_after: Option<u64>) -> Self {
        match status {
            401 | 403 => Self::Authentication {
                message: format!("{} rejected credentials (HTTP {})", context, status),
                code: ErrorCode::AuthInvalidCredentials,
                source: None,
            },
            404 => Self::Provider {
                message: format!("{} returned HTTP 404", context),
                code: ErrorCode::PrvNotFound,
            },
            408 => Self::Timeout(format!("{} returned HTTP 408", context)),
            429 => Self::RateLimit {
                message: format!("{} returned HTTP 429", context),
                code: ErrorCode::RateLimitExceeded,
                retry_after,
            },
            500..=599 => Self::Network {
                message: format!("{} returned HTTP {}", context, status),
                code: ErrorCode::NetServerError,
                source: None,
            },
            _ => Self::Provider {
                message: format!("{} returned HTTP {}", context, status),
                code: ErrorCode::PrvBadRequest,
            },
        }
    }
}

impl From<rusqlite::Error> for FerryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
            code: ErrorCode::DbOperationFailed,
            source: Some(Box::new(err)),
        }
    }
}

impl From<reqwest::Error> for FerryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_http_status(status.as_u16(), "request", None);
        }
        if err.is_decode() {
            return Self::Parse {
                message: err.to_string(),
                code: ErrorCode::ParseInvalidJson,
            };
        }
        Self::Network {
            message: err.to_string(),
            code: ErrorCode::NetConnectionFailed,
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        let err = FerryError::from_http_status(401, "whatsapp auth", None);
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!err.is_retryable());

        let err = FerryError::from_http_status(429, "twilio page", Some(7));
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(7));

        let err = FerryError::from_http_status(503, "graph page", None);
        assert_eq!(err.code(), ErrorCode::NetServerError);
        assert!(err.is_retryable());

        let err = FerryError::from_http_status(400, "graph page", None);
        assert!(!err.is_retryable());

        let err = FerryError::from_http_status(404, "graph page", None);
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_media_error_is_not_fatal_kind() {
        let err = FerryError::media("photo.jpg", "404");
        assert_eq!(err.kind(), ErrorKind::PartialMediaDownload);
        assert!(err.to_string().contains("photo.jpg"));
    }

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::AuthInvalidCredentials.as_str(), "AUTH_001");
        assert_eq!(ErrorCode::StoWriteFailed.as_str(), "STO_001");
        assert_eq!(ErrorKind::PartialMediaDownload.to_string(), "partial_media_download");
    }
}
