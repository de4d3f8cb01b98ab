//! Pool configuration.
//!
//! Values come from [`ExecutorBuilder`](crate::executor::ExecutorBuilder)
//! with environment fallbacks for the worker count.

use crate::task::FunctionTask;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Environment variable overriding the worker count.
pub const MAX_WORKERS_ENV: &str = "DISTPOOL_MAX_WORKERS";

/// Time source for the polling loops.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspends the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock whose time only moves when something sleeps on it.
///
/// Sleeping advances the clock instantly and yields the thread, so loops
/// driven by it never block on real time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Creates a clock starting at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Moves time forward without sleeping.
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        std::thread::yield_now();
    }
}

/// Polling interval and backoff for busy-wait loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// First sleep after an idle iteration.
    pub interval: Duration,
    /// Upper bound for the sleep.
    pub max_interval: Duration,
    /// Growth factor applied after each idle iteration.
    pub multiplier: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(20),
            multiplier: 2,
        }
    }
}

impl PollPolicy {
    /// Fixed interval without growth.
    #[must_use]
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1,
        }
    }

    /// Starts a backoff sequence.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.interval,
        }
    }
}

/// Growing sleep interval, reset whenever a loop makes progress.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: PollPolicy,
    current: Duration,
}

impl Backoff {
    /// Returns the next sleep and grows the interval.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .saturating_mul(self.policy.multiplier.max(1))
            .min(self.policy.max_interval.max(self.policy.interval));
        delay
    }

    /// Back to the first interval.
    pub fn reset(&mut self) {
        self.current = self.policy.interval;
    }

    /// Sleeps on `clock` for the next interval.
    pub fn wait(&mut self, clock: &dyn Clock) {
        let delay = self.next_delay();
        clock.sleep(delay);
    }
}

/// Adjustments each worker process applies before accepting tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSetup {
    /// Working directory to switch to.
    pub workdir: Option<PathBuf>,
    /// Environment variables to set.
    pub env: BTreeMap<String, String>,
    /// Directories prepended to `PATH`.
    pub path: Vec<PathBuf>,
}

impl WorkerSetup {
    /// Returns true when there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workdir.is_none() && self.env.is_empty() && self.path.is_empty()
    }

    /// Applies the adjustments to the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory cannot be entered or the
    /// search path cannot be joined.
    pub fn apply(&self) -> std::io::Result<()> {
        if !self.path.is_empty() {
            let mut dirs = self.path.clone();
            if let Some(existing) = std::env::var_os("PATH") {
                dirs.extend(std::env::split_paths(&existing));
            }
            let joined: OsString = std::env::join_paths(dirs)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            std::env::set_var("PATH", joined);
        }
        for (key, value) in &self.env {
            std::env::set_var(key, value);
        }
        if let Some(dir) = &self.workdir {
            std::env::set_current_dir(dir)?;
        }
        debug!("Applied worker setup: {self:?}");
        Ok(())
    }
}

/// Configuration shared by the pool, its manager and its workers.
#[derive(Clone)]
pub struct PoolConfig {
    /// Worker count; overrides capacity detection when set.
    pub max_workers: Option<usize>,
    /// Polling behaviour of every busy-wait loop.
    pub poll: PollPolicy,
    /// Function run once per worker before it accepts tasks.
    pub initializer: Option<FunctionTask>,
    /// Adjustments applied by worker processes.
    pub setup: WorkerSetup,
    /// Outstanding results older than this fail with a transport error.
    pub result_timeout: Option<Duration>,
    /// Bound on establishing the worker group.
    pub bootstrap_timeout: Duration,
    /// Bound on delivering shutdown and setup-abort signals to workers.
    pub shutdown_grace: Duration,
    /// Time source for the polling loops.
    pub clock: Arc<dyn Clock>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            poll: PollPolicy::default(),
            initializer: None,
            setup: WorkerSetup::default(),
            result_timeout: None,
            bootstrap_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            clock: Arc::new(SystemClock),
        }
    }
}

impl PoolConfig {
    /// Explicit worker count, falling back to `DISTPOOL_MAX_WORKERS`.
    #[must_use]
    pub fn resolved_max_workers(&self) -> Option<usize> {
        self.max_workers.or_else(max_workers_from_env)
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_workers", &self.max_workers)
            .field("poll", &self.poll)
            .field("initializer", &self.initializer.as_ref().map(FunctionTask::name))
            .field("setup", &self.setup)
            .field("result_timeout", &self.result_timeout)
            .field("bootstrap_timeout", &self.bootstrap_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

fn max_workers_from_env() -> Option<usize> {
    let raw = std::env::var(MAX_WORKERS_ENV).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => {
            warn!("Ignoring {MAX_WORKERS_ENV}={raw}: expected a positive integer");
            None
        }
        Ok(n) => Some(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            multiplier: 2,
        };
        let mut backoff = policy.backoff();
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
    }

    #[test]
    fn test_fixed_policy() {
        let mut backoff = PollPolicy::fixed(Duration::from_millis(3)).backoff();
        assert_eq!(backoff.next_delay(), Duration::from_millis(3));
        assert_eq!(backoff.next_delay(), Duration::from_millis(3));
    }

    #[test]
    fn test_manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(10));
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(15));
    }

    #[test]
    fn test_backoff_waits_on_clock() {
        let clock = ManualClock::new();
        let start = clock.now();
        let mut backoff = PollPolicy::fixed(Duration::from_millis(7)).backoff();
        backoff.wait(&clock);
        backoff.wait(&clock);
        assert_eq!(clock.now() - start, Duration::from_millis(14));
    }

    #[test]
    fn test_explicit_max_workers_wins() {
        let config = PoolConfig {
            max_workers: Some(3),
            ..PoolConfig::default()
        };
        assert_eq!(config.resolved_max_workers(), Some(3));
    }

    #[test]
    fn test_empty_setup() {
        assert!(WorkerSetup::default().is_empty());
        let setup = WorkerSetup {
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            ..WorkerSetup::default()
        };
        assert!(!setup.is_empty());
    }
}
