use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

/// Connection backoff parameters, with the defaults specified at
/// <https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md>.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// The delay before the first retry.
    pub initial_delay: Duration,
    /// The factor applied to the delay after each failed retry.
    pub multiplier: f64,
    /// The factor with which delays are randomized.
    pub jitter: f64,
    /// The upper bound of the un-jittered delay.
    pub max_delay: Duration,
}

pub const DEFAULT_BACKOFF_CONFIG: BackoffConfig = BackoffConfig {
    initial_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

struct Inner {
    /// Completed run count; drives the exponent.
    attempts: u32,
    running: bool,
    task: Option<JoinHandle<()>>,
}

/// A one-shot timer producing jittered exponential delays.
///
/// Each `run_once` schedules its callback after
/// `min(max, initial * multiplier^n) * uniform(1 - jitter, 1 + jitter)` and
/// increments `n`. `reset` returns the delay to its initial value without
/// cancelling a pending timer; only `stop` cancels.
pub struct BackoffTimer {
    config: BackoffConfig,
    inner: Arc<Mutex<Inner>>,
}

impl BackoffTimer {
    pub fn new(config: BackoffConfig) -> BackoffTimer {
        BackoffTimer {
            config,
            inner: Arc::new(Mutex::new(Inner {
                attempts: 0,
                running: false,
                task: None,
            })),
        }
    }

    pub fn with_defaults() -> BackoffTimer {
        BackoffTimer::new(DEFAULT_BACKOFF_CONFIG)
    }

    /// The next un-jittered delay.
    fn base_delay(&self, attempts: u32) -> Duration {
        let delay = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(attempts as i32);
        Duration::from_secs_f64(delay.min(self.config.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    /// Schedules `callback` to run after the next backoff delay. A no-op if a
    /// timer is already pending.
    pub fn run_once(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if inner.running {
            return;
        }
        let delay = self.jittered(self.base_delay(inner.attempts));
        inner.attempts = inner.attempts.saturating_add(1);
        inner.running = true;

        let shared = self.inner.clone();
        inner.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = shared.lock().unwrap();
                inner.running = false;
                inner.task = None;
            }
            callback();
        }));
    }

    /// Cancels the pending timer, if any. The attempt count is untouched.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.running = false;
    }

    /// Returns the delay to its initial value. Does not cancel a pending
    /// timer.
    pub fn reset(&self) {
        self.inner.lock().unwrap().attempts = 0;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
