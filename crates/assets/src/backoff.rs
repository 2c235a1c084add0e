//! Exponential pause after a download fails on every mirror.
//!
//! One [`Backoff`] is created per pass and cloned into everything that
//! fetches, so repeated failures anywhere slow the whole pass down.

use crate::cancel::Cancellation;
use crate::error::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backoff tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first doubling.
    pub initial: Duration,
    /// Upper bound for any single pause.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

/// Shared doubling delay, capped at [`BackoffConfig::max`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Arc<Mutex<Duration>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: Arc::new(Mutex::new(config.initial)),
        }
    }

    /// Advance the shared state and return the delay to wait.
    pub fn next_delay(&self) -> Duration {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = (*current * 2).min(self.config.max);
        *current
    }

    /// Advance and sleep, honoring cancellation.
    pub fn pause(&self, cancel: &Cancellation) -> Result<()> {
        let delay = self.next_delay();
        log::info!("backing off for {}s after download failure", delay.as_secs());
        cancel.sleep(delay)
    }
}
