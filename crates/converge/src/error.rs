//! Engine errors and error classification.

use crate::task::TaskKey;
use std::fmt;
use std::io;

/// Coarse classification of any error surfaced by a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed configuration or task input.
    InputValidation,
    /// Something a task needs does not exist.
    NotFound,
    /// Temporary failure, usually network.
    Transient,
    /// Hash mismatch or unparseable stored data.
    Integrity,
    /// The task graph or a lifecycle rule is violated.
    Semantic,
    /// A spawned command exited unsuccessfully.
    ExternalCommand,
    /// Permission denied.
    Permission,
    /// The run was cancelled.
    Cancelled,
    Other,
}

impl ErrorKind {
    /// Whether retrying later might succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::ExternalCommand | Self::NotFound)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InputValidation => "Invalid input",
            Self::NotFound => "Not found",
            Self::Transient => "Temporary failure",
            Self::Integrity => "Integrity check failed",
            Self::Semantic => "Invalid task graph",
            Self::ExternalCommand => "Command failed",
            Self::Permission => "Permission denied",
            Self::Cancelled => "Cancelled",
            Self::Other => "Unexpected error",
        };
        write!(f, "{s}")
    }
}

/// Errors raised by the engine itself.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("task of type {kind} has an empty name")]
    EmptyName { kind: String },

    #[error("duplicate task {0}")]
    DuplicateTask(TaskKey),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskKey, dependency: TaskKey },

    #[error("malformed task key {0:?}, expected kind/name")]
    MalformedKey(String),

    #[error("circular dependency among tasks: {}", .tasks.join(", "))]
    CircularDependency { tasks: Vec<String> },

    /// The task has no rendering for the active target.
    #[error("task {task} is not supported by the {target} target")]
    Unmapped { task: TaskKey, target: &'static str },

    #[error("no tasks made progress")]
    NoProgress,

    #[error("{task} was expected to exist but was not found")]
    Missing { task: TaskKey },

    #[error("{task} does not match expected state, changed fields: {}", .fields.join(", "))]
    ValidationFailed { task: TaskKey, fields: Vec<String> },

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyName { .. } | Self::MalformedKey(_) | Self::NotConfigured(_) => {
                ErrorKind::InputValidation
            }
            Self::Missing { .. } => ErrorKind::NotFound,
            Self::DuplicateTask(_)
            | Self::UnknownDependency { .. }
            | Self::CircularDependency { .. }
            | Self::Unmapped { .. }
            | Self::NoProgress
            | Self::ValidationFailed { .. } => ErrorKind::Semantic,
        }
    }
}

/// A spawned command exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("command `{command}` failed ({status}): {}", .output.trim())]
pub struct CommandError {
    pub command: String,
    pub status: String,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Classify an error by walking its cause chain.
#[must_use]
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<EngineError>() {
            return e.kind();
        }
        if cause.downcast_ref::<CommandError>().is_some() {
            return ErrorKind::ExternalCommand;
        }
        if let Some(e) = cause.downcast_ref::<assets::Error>() {
            return match e.category() {
                assets::ErrorCategory::InputValidation => ErrorKind::InputValidation,
                assets::ErrorCategory::NotFound => ErrorKind::NotFound,
                assets::ErrorCategory::Transient => ErrorKind::Transient,
                assets::ErrorCategory::Integrity => ErrorKind::Integrity,
                assets::ErrorCategory::Cancelled => ErrorKind::Cancelled,
                assets::ErrorCategory::Other => ErrorKind::Other,
            };
        }
        if let Some(e) = cause.downcast_ref::<keystore::Error>() {
            return match e.category() {
                keystore::ErrorCategory::InputValidation => ErrorKind::InputValidation,
                keystore::ErrorCategory::NotFound => ErrorKind::NotFound,
                keystore::ErrorCategory::Integrity => ErrorKind::Integrity,
                keystore::ErrorCategory::ReadOnly => ErrorKind::Permission,
                keystore::ErrorCategory::Other => ErrorKind::Other,
            };
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            return match e.kind() {
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => ErrorKind::Transient,
                _ => ErrorKind::Other,
            };
        }
    }
    ErrorKind::Other
}
