//! Error types for keystore operations.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type alias for keystore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of keystore errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad key, certificate or keyset input.
    InputValidation,
    /// Keyset, secret or credential missing.
    NotFound,
    /// Stored material failed validation or round-trip parsing.
    Integrity,
    /// Write attempted against a read-only backend.
    ReadOnly,
    /// Other/unknown errors.
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InputValidation => "Invalid input",
            Self::NotFound => "Not found",
            Self::Integrity => "Integrity check failed",
            Self::ReadOnly => "Read-only keystore",
            Self::Other => "Unexpected error",
        };
        write!(f, "{s}")
    }
}

/// Errors that can occur in the keystore.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A certificate could not be parsed.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// A private key could not be parsed or generated.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Building or signing a certificate failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// A keyset violates its invariants.
    #[error("keyset {name:?} is invalid: {message}")]
    InvalidKeyset {
        /// Keyset name.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// A keyset item operation was rejected.
    #[error("{0}")]
    Item(String),

    /// A keyset was required but not found.
    #[error("keyset {0:?} not found")]
    KeysetNotFound(String),

    /// A secret was required but not found.
    #[error("secret {0:?} not found")]
    SecretNotFound(String),

    /// SSH public key could not be parsed.
    #[error("invalid SSH public key: {0}")]
    InvalidSshKey(String),

    /// Write attempted against a read-only backend.
    #[error("keystore is read-only: cannot {0}")]
    ReadOnly(String),

    /// Stored document could not be (de)serialized.
    #[error("failed to parse {what}: {message}")]
    Serialization {
        /// What was being parsed.
        what: String,
        /// Parser message.
        message: String,
    },

    /// Remote backend failure.
    #[error("keystore backend error: {0}")]
    Backend(String),

    /// IO error during file operations.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved in the error.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_keyset(name: &str, message: impl Into<String>) -> Self {
        Self::InvalidKeyset {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Get the error category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidKey(_) | Error::InvalidSshKey(_) | Error::Item(_) => {
                ErrorCategory::InputValidation
            }
            Error::InvalidCertificate(_)
            | Error::InvalidKeyset { .. }
            | Error::Serialization { .. } => ErrorCategory::Integrity,
            Error::KeysetNotFound(_) | Error::SecretNotFound(_) => ErrorCategory::NotFound,
            Error::ReadOnly(_) => ErrorCategory::ReadOnly,
            Error::Signing(_) | Error::Backend(_) => ErrorCategory::Other,
            Error::Io { source, .. } => {
                if source.kind() == io::ErrorKind::NotFound {
                    ErrorCategory::NotFound
                } else {
                    ErrorCategory::Other
                }
            }
        }
    }
}
