//! Error types for resources, downloads and the asset cache.
//!
//! Errors are categorized so callers can tell a transient fetch failure
//! (retry on the next wave) from a corrupt download (always fatal).

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type alias for asset operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of asset errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed asset id, hash or URL.
    InputValidation,
    /// Asset or file missing.
    NotFound,
    /// Network failures; retried across mirrors and then by the caller.
    Transient,
    /// Hash mismatch or ambiguous lookup.
    Integrity,
    /// The operation was cancelled.
    Cancelled,
    /// Other/unknown errors.
    Other,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Get a user-friendly description of this error category.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::InputValidation => "Invalid asset reference",
            Self::NotFound => "Asset not found",
            Self::Transient => "Network connectivity issue",
            Self::Integrity => "Asset integrity check failed",
            Self::Cancelled => "Cancelled",
            Self::Other => "Unexpected error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur while reading resources or fetching assets.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP request failed.
    #[error("HTTP request for {url} failed: {message}")]
    Http {
        /// URL being fetched.
        url: String,
        /// Error message.
        message: String,
        /// HTTP status code if available.
        status: Option<u16>,
    },

    /// Every mirror for an asset failed.
    #[error("unable to download from any of {urls:?}: {last}")]
    AllMirrorsFailed {
        /// URLs attempted, in order.
        urls: Vec<String>,
        /// Last error seen.
        last: String,
    },

    /// Downloaded or cached bytes did not match the expected hash.
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        /// File that was checked.
        path: PathBuf,
        /// Expected hash (hex).
        expected: String,
        /// Computed hash (hex).
        actual: String,
    },

    /// Hash string could not be parsed.
    #[error("invalid hash {0:?}: expected 32, 40 or 64 hex characters")]
    InvalidHash(String),

    /// Asset id could not be parsed.
    #[error("invalid asset id {0:?}")]
    InvalidAssetId(String),

    /// Lookup matched more than one asset.
    #[error("found {count} assets matching {key:?} (asset path {asset_path:?})")]
    Ambiguous {
        /// Key searched for.
        key: String,
        /// Asset path suffix searched for.
        asset_path: String,
        /// Number of matches.
        count: usize,
    },

    /// A task-dependent resource was read before its producer ran.
    #[error("resource produced by task {0} is not available yet")]
    NotReady(String),

    /// Archive extraction failed.
    #[error("failed to extract {path}: {message}")]
    Extraction {
        /// Archive being extracted.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// IO error during file operations.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved in the error.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an HTTP error from a ureq failure.
    pub fn http(url: &str, err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::Http {
                url: url.to_string(),
                message: format!("HTTP {code}"),
                status: Some(code),
            },
            other => Self::Http {
                url: url.to_string(),
                message: other.to_string(),
                status: None,
            },
        }
    }

    /// Get the error category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Http { .. } | Error::AllMirrorsFailed { .. } => ErrorCategory::Transient,
            Error::HashMismatch { .. } | Error::Ambiguous { .. } => ErrorCategory::Integrity,
            Error::InvalidHash(_) | Error::InvalidAssetId(_) => ErrorCategory::InputValidation,
            Error::NotReady(_) => ErrorCategory::NotFound,
            Error::Extraction { .. } => ErrorCategory::Other,
            Error::Io { source, .. } => {
                if source.kind() == io::ErrorKind::NotFound {
                    ErrorCategory::NotFound
                } else {
                    ErrorCategory::Other
                }
            }
            Error::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_errors_are_transient() {
        let err = Error::Http {
            url: "https://example.com/a".to_string(),
            message: "HTTP 503".to_string(),
            status: Some(503),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_hash_mismatch_is_fatal() {
        let err = Error::HashMismatch {
            path: PathBuf::from("/cache/x"),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Integrity);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_not_found_category() {
        let err = Error::io("/missing", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(err.to_string().contains("/missing"));
    }
}
