use crate::read_mode::ReadMode;
use chrono::{DateTime, Utc};

/// Error taxonomy for tag reads and the cache layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderError {
    /// Tag (or its metadata) does not exist on the historian.
    NotFound { tag: String },
    /// Backend unreachable or answered with a bad status.
    Connection(String),
    /// The backend does not implement this read mode.
    UnsupportedMode { mode: ReadMode, backend: String },
    /// Rejected before any backend call was attempted.
    InvalidRequest(String),
    /// The cache location could not be prepared.
    CacheUnavailable(String),
    /// Backing store failure.
    Storage(String),
    /// Payload could not be encoded or decoded.
    Serialization(String),
    /// Backend kept returning full pages past the page budget.
    PaginationOverflow { tag: String, pages: usize },
    /// Backend returned a full page that did not advance the read position.
    PaginationStalled { tag: String, at: DateTime<Utc> },
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { tag } => write!(f, "Tag not found: {}", tag),
            Self::Connection(msg) => write!(f, "Backend connection failed: {}", msg),
            Self::UnsupportedMode { mode, backend } => {
                write!(
                    f,
                    "Read mode {} is not supported by backend {}",
                    mode, backend
                )
            }
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::CacheUnavailable(msg) => write!(f, "Cache unavailable: {}", msg),
            Self::Storage(msg) => write!(f, "Cache storage error: {}", msg),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::PaginationOverflow { tag, pages } => {
                write!(
                    f,
                    "Backend returned full pages for {} beyond the limit of {} pages",
                    tag, pages
                )
            }
            Self::PaginationStalled { tag, at } => {
                write!(
                    f,
                    "Backend pagination for {} did not advance past {}",
                    tag,
                    at.to_rfc3339()
                )
            }
        }
    }
}

impl std::error::Error for ReaderError {}

impl ReaderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Connection(_) => "connection",
            Self::UnsupportedMode { .. } => "unsupported_mode",
            Self::InvalidRequest(_) => "invalid_request",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::PaginationOverflow { .. } => "pagination_overflow",
            Self::PaginationStalled { .. } => "pagination_stalled",
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn not_found(tag: impl Into<String>) -> Self {
        Self::NotFound { tag: tag.into() }
    }

    /// Recovered locally during batch reads instead of aborting them.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<rusqlite::Error> for ReaderError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "cache database error");
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ReaderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ReaderError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<csv::Error> for ReaderError {
    fn from(err: csv::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type ReaderResult<T> = Result<T, ReaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_context() {
        let err = ReaderError::UnsupportedMode {
            mode: ReadMode::Total,
            backend: "memory".to_string(),
        };
        assert!(err.to_string().contains("TOTAL"));
        assert!(err.to_string().contains("memory"));

        let err = ReaderError::PaginationOverflow {
            tag: "tag1".to_string(),
            pages: 5,
        };
        assert!(err.to_string().contains("tag1"));
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ReaderError::not_found("x").code(), "not_found");
        assert_eq!(ReaderError::invalid("x").code(), "invalid_request");
        assert_eq!(
            ReaderError::Connection("down".to_string()).code(),
            "connection"
        );
        assert!(ReaderError::not_found("x").is_not_found());
        assert!(!ReaderError::invalid("x").is_not_found());
    }

    #[test]
    fn converts_json_errors() {
        let err: ReaderError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), "serialization");
    }
}
