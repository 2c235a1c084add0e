use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Apply changes to the machine the process runs on.
#[derive(Debug)]
pub struct LocalTarget {
    cache_dir: PathBuf,
    state_dir: PathBuf,
    package_lock: Mutex<()>,
}

impl LocalTarget {
    pub fn new(cache_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            state_dir: state_dir.into(),
            package_lock: Mutex::new(()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where tasks keep markers between runs.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Serializes package manager invocations across tasks.
    pub fn lock_packages(&self) -> MutexGuard<'_, ()> {
        self.package_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}
