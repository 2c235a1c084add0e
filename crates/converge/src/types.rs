//! Run options and results.

use crate::task::Lifecycle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of running one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    /// Actual state already matched.
    NoChange,
    /// Nothing existed and the target rendered it.
    Created,
    /// Something existed and the target changed it.
    Modified,
    /// Not rendered.
    Skipped { reason: String },
}

impl ApplyResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Modified)
    }
}

/// Counts of task outcomes across a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub modified: usize,
    pub skipped: usize,
    pub no_change: usize,
    /// Task failures that later succeeded on retry.
    pub retried: usize,
}

impl ExecuteSummary {
    pub fn total_changes(&self) -> usize {
        self.created + self.modified
    }

    pub fn total(&self) -> usize {
        self.created + self.modified + self.skipped + self.no_change
    }

    pub fn merge(&mut self, other: &ExecuteSummary) {
        self.created += other.created;
        self.modified += other.modified;
        self.skipped += other.skipped;
        self.no_change += other.no_change;
        self.retried += other.retried;
    }

    pub fn add_result(&mut self, result: &ApplyResult) {
        match result {
            ApplyResult::NoChange => self.no_change += 1,
            ApplyResult::Created => self.created += 1,
            ApplyResult::Modified => self.modified += 1,
            ApplyResult::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Options for a run.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Threads per wave; 1 runs tasks sequentially.
    pub jobs: usize,
    /// Default for tasks that do not say whether to look for existing state.
    pub check_existing: bool,
    /// Lifecycle per task kind, taking precedence over the task's own.
    pub lifecycle_overrides: BTreeMap<String, Lifecycle>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            check_existing: true,
            lifecycle_overrides: BTreeMap::new(),
        }
    }
}
