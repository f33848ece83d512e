use std::fmt;
use serde::{Deserialize, Serialize};

/// Main error type for vmexport-core
#[derive(Debug)]
pub enum Error {
    /// Malformed or missing fields on a job/schedule submission
    Validation(String),

    /// An entity with this id already exists
    AlreadyExists(String),

    /// No entity with this id
    NotFound(String),

    /// Queue is at configured capacity
    QueueFull(String),

    /// Provider configuration is invalid
    Config(String),

    /// Provider credential check failed
    Auth(String),

    /// Provider connection attempt failed
    Connect(String),

    /// No provider registered under this type tag
    UnknownProvider(String),

    /// Per-job deadline exceeded
    Timeout(String),

    /// Job was cancelled by an operator
    Cancelled(String),

    /// Durable store errors (wrapped sqlx)
    Store(sqlx::Error),

    /// Network errors talking to a provider endpoint
    Network(String),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Cron expression parse/evaluation errors
    Cron(String),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "validation error: {}", msg),
            Error::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::QueueFull(msg) => write!(f, "queue full: {}", msg),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Auth(msg) => write!(f, "authentication error: {}", msg),
            Error::Connect(msg) => write!(f, "connection error: {}", msg),
            Error::UnknownProvider(msg) => write!(f, "unknown provider: {}", msg),
            Error::Timeout(msg) => write!(f, "timeout: {}", msg),
            Error::Cancelled(msg) => write!(f, "cancelled: {}", msg),
            Error::Store(e) => write!(f, "store error: {}", e),
            Error::Network(msg) => write!(f, "network error: {}", msg),
            Error::Serialization(e) => write!(f, "serialization error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Cron(msg) => write!(f, "cron error: {}", msg),
            Error::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Store(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Network(error.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Self {
        Error::Validation(format!("invalid id: {}", error))
    }
}

impl From<cron::error::Error> for Error {
    fn from(error: cron::error::Error) -> Self {
        Error::Cron(error.to_string())
    }
}

// Common error constructors
impl Error {
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    pub fn already_exists<T: Into<String>>(msg: T) -> Self {
        Error::AlreadyExists(msg.into())
    }

    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn queue_full<T: Into<String>>(msg: T) -> Self {
        Error::QueueFull(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    pub fn auth<T: Into<String>>(msg: T) -> Self {
        Error::Auth(msg.into())
    }

    pub fn connect<T: Into<String>>(msg: T) -> Self {
        Error::Connect(msg.into())
    }

    pub fn unknown_provider<T: Into<String>>(msg: T) -> Self {
        Error::UnknownProvider(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn cancelled<T: Into<String>>(msg: T) -> Self {
        Error::Cancelled(msg.into())
    }

    pub fn network<T: Into<String>>(msg: T) -> Self {
        Error::Network(msg.into())
    }

    /// Whether a worker should retry after this error, independent of attempt budget.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::Network(_) | Error::Timeout(_) | Error::Store(_)
        )
    }
}

impl Error {
    /// HTTP-status-shaped mapping, consumed by the (out of scope) REST layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::AlreadyExists(_) => 409,
            Error::NotFound(_) => 404,
            Error::QueueFull(_) => 429,
            Error::Config(_) => 500,
            Error::Auth(_) => 401,
            Error::Connect(_) => 502,
            Error::UnknownProvider(_) => 400,
            Error::Timeout(_) => 504,
            Error::Cancelled(_) => 409,
            Error::Store(_) => 500,
            Error::Network(_) => 503,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Cron(_) => 400,
            Error::Other(_) => 500,
        }
    }

    /// Stable category string for metrics/audit.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::AlreadyExists(_) => "already_exists",
            Error::NotFound(_) => "not_found",
            Error::QueueFull(_) => "queue_full",
            Error::Config(_) => "config",
            Error::Auth(_) => "auth",
            Error::Connect(_) => "connect",
            Error::UnknownProvider(_) => "unknown_provider",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Store(_) => "store",
            Error::Network(_) => "network",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Cron(_) => "cron",
            Error::Other(_) => "other",
        }
    }
}

/// Aggregated field-level validation failures, used by job/schedule submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: Option<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
            code: None,
        });
    }

    pub fn add_with_code(
        &mut self,
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
            code: Some(code.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_error(self) -> Error {
        Error::Validation(serde_json::to_string(&self).unwrap_or_else(|_| "validation failed".to_string()))
    }
}

impl Default for ValidationErrors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(Error::not_found("job").status_code(), 404);
        assert_eq!(Error::queue_full("full").status_code(), 429);
        assert_eq!(Error::timeout("deadline").status_code(), 504);
    }

    #[test]
    fn retriable_kinds() {
        assert!(Error::connect("x").is_retriable());
        assert!(Error::timeout("x").is_retriable());
        assert!(!Error::validation("x").is_retriable());
        assert!(!Error::cancelled("x").is_retriable());
    }

    #[test]
    fn validation_errors_builder() {
        let mut errs = ValidationErrors::new();
        assert!(errs.is_empty());
        errs.add("name", "required");
        assert!(!errs.is_empty());
        let err = errs.into_error();
        assert!(matches!(err, Error::Validation(_)));
    }
}
