//! Exponential backoff between stream restart attempts.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::BackoffConfig;
use crate::worker_queue::DelayedTask;
use crate::worker_queue::WorkerQueue;

/// Upper bound of the additive jitter, as a fraction of the delay.
const JITTER_FACTOR: f64 = 0.2;

/// Delay generator coupled to a [`WorkerQueue`].
///
/// The first [`run_after_delay`](ExponentialBackoff::run_after_delay) fires
/// immediately; each subsequent call multiplies the delay by the configured
/// factor up to the ceiling. A successful inbound frame resets the delay to
/// zero, a resource-exhausted close saturates it to the ceiling.
pub struct ExponentialBackoff {
    queue: WorkerQueue,
    initial_delay: Duration,
    factor: f64,
    max_delay: Duration,
    current_delay: Duration,
    pending: Option<DelayedTask>,
}

impl ExponentialBackoff {
    pub fn new(
        queue: WorkerQueue,
        config: BackoffConfig,
    ) -> Self {
        debug_assert!(config.validate().is_ok(), "invalid backoff config");
        Self {
            queue,
            initial_delay: config.initial_delay(),
            factor: config.factor,
            max_delay: config.max_delay(),
            current_delay: Duration::ZERO,
            pending: None,
        }
    }

    /// Schedules `task` on the worker queue after the current delay, then
    /// grows the delay for the next attempt. A previously pending task is
    /// cancelled first; there is never more than one in flight.
    pub fn run_after_delay(
        &mut self,
        task: impl FnOnce() + Send + 'static,
    ) {
        self.cancel();

        let delay = Self::jittered(self.current_delay);
        debug!(delay_ms = delay.as_millis() as u64, "scheduling backoff task");
        self.pending = Some(self.queue.dispatch_after(delay, task));

        self.current_delay = self
            .current_delay
            .mul_f64(self.factor)
            .clamp(self.initial_delay, self.max_delay);
    }

    /// Cancels any pending task and makes the next attempt immediate.
    pub fn reset(&mut self) {
        self.cancel();
        self.current_delay = Duration::ZERO;
    }

    /// Saturates the delay so the next attempt waits the full ceiling.
    pub fn reset_to_max(&mut self) {
        self.current_delay = self.max_delay;
    }

    /// Cancels the pending task, if any.
    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.cancel();
        }
    }

    /// The delay the next attempt would be scheduled with, jitter excluded.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Adds uniform jitter in `[0, JITTER_FACTOR × delay)` so restarting
    /// clients do not stampede in lockstep.
    fn jittered(delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        delay + delay.mul_f64(rand::thread_rng().gen_range(0.0..JITTER_FACTOR))
    }
}

impl std::fmt::Debug for ExponentialBackoff {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("current_delay", &self.current_delay)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}
