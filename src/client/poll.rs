//! Busy-poll helpers shared by the board clients and the orchestrator.

use crate::error::{AppResult, DaqError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Default interval between polls of a board state.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag checked between poll iterations.
pub trait Interrupt: Send + Sync {
    /// True once the surrounding system wants the current wait abandoned.
    fn is_interrupted(&self) -> bool;
}

impl Interrupt for AtomicBool {
    fn is_interrupted(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// How a blocking wait polls: a fixed interval and an optional ceiling.
///
/// `max_wait: None` waits indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between two probes
    pub interval: Duration,
    /// Give up with `Timeout` after this long
    pub max_wait: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

impl PollPolicy {
    /// Poll at `interval` with no ceiling.
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_wait: None,
        }
    }

    /// Set the maximum wait.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Call `probe` until it returns true. Returns the number of probes made.
    ///
    /// The interrupt (if any) is checked before every sleep, and the ceiling
    /// is checked after it. Probe errors propagate immediately.
    pub fn wait_until<F>(
        &self,
        operation: &str,
        interrupt: Option<&dyn Interrupt>,
        mut probe: F,
    ) -> AppResult<u32>
    where
        F: FnMut() -> AppResult<bool>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if probe()? {
                trace!(operation, attempts, "poll satisfied");
                return Ok(attempts);
            }
            if interrupt.is_some_and(|flag| flag.is_interrupted()) {
                return Err(DaqError::Interrupted(operation.to_owned()));
            }
            std::thread::sleep(self.interval);
            if let Some(max_wait) = self.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    return Err(DaqError::Timeout {
                        operation: operation.to_owned(),
                        waited,
                    });
                }
            }
        }
    }
}
