//! In-process fallback pool.
//!
//! Used when no more than one worker is available. The calling thread is
//! the first worker; helper threads are added right before a task runs if
//! more work is queued, up to the configured ceiling.

use crate::config::PoolConfig;
use crate::error::{FailureKind, PoolError, Result, TaskFailure};
use crate::executor::process::GroupLauncher;
use crate::fabric::Outcome;
use crate::future::TaskFuture;
use crate::queue::{Entry, WorkQueue};
use crate::task::registry::FunctionRegistry;
use crate::task::{encode, ExecutableTask, Task};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::thread::Scope;
use tracing::{debug, info, warn};

/// Thread pool serving a [`WorkQueue`] inside the producer process.
pub struct LocalThreadPool {
    queue: WorkQueue,
    registry: Arc<FunctionRegistry>,
    config: PoolConfig,
    ceiling: usize,
    threads: Mutex<usize>,
    launcher: OnceLock<std::result::Result<GroupLauncher, String>>,
}

impl LocalThreadPool {
    /// Creates a pool running at most `ceiling` threads (at least one).
    #[must_use]
    pub fn new(queue: WorkQueue, registry: Arc<FunctionRegistry>, config: PoolConfig, ceiling: usize) -> Self {
        Self {
            queue,
            registry,
            config,
            ceiling: ceiling.max(1),
            threads: Mutex::new(0),
            launcher: OnceLock::new(),
        }
    }

    /// Maximum number of threads.
    #[must_use]
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Threads started so far, the calling thread included.
    #[must_use]
    pub fn threads(&self) -> usize {
        *self.threads.lock()
    }

    /// Serves the queue on the calling thread until the shutdown sentinel.
    ///
    /// `ready` is called with the ceiling once the calling thread ran the
    /// initializer. Helper threads are joined and the sentinel is removed
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Bootstrap` if the initializer fails on the calling
    /// thread; no task is taken in that case.
    pub fn run(&self, ready: impl FnOnce(usize)) -> Result<()> {
        if let Err(failure) = self.initialize() {
            return Err(PoolError::Bootstrap {
                reason: format!("Initializer failed: {}", failure.message),
            });
        }
        *self.threads.lock() = 1;
        info!("Local pool serving with up to {} threads", self.ceiling);
        ready(self.ceiling);

        std::thread::scope(|scope| self.work(scope));

        match self.queue.pop() {
            Some(Entry::Shutdown) | None => {}
            Some(Entry::Work(future, task)) => {
                warn!("Task {} arrived after shutdown", task.id());
                if future.set_running_or_notify_cancel() {
                    let _ = future.set_failure(TaskFailure::execution("Pool shut down before the task ran"));
                }
            }
        }
        debug!("Local pool stopped after {} threads", self.threads());
        Ok(())
    }

    fn initialize(&self) -> std::result::Result<(), TaskFailure> {
        match &self.config.initializer {
            Some(initializer) => self.registry.call(initializer).map(|_| ()),
            None => Ok(()),
        }
    }

    fn work<'scope, 'env>(&'env self, scope: &'scope Scope<'scope, 'env>) {
        let mut backoff = self.config.poll.backoff();
        loop {
            let Some(entry) = self.queue.pop() else {
                backoff.wait(&*self.config.clock);
                continue;
            };
            backoff.reset();

            let (future, task) = match entry {
                Entry::Shutdown => {
                    self.queue.push_shutdown();
                    break;
                }
                Entry::Work(future, task) => (future, task),
            };
            if !future.set_running_or_notify_cancel() {
                debug!("Skipping cancelled task {}", task.id());
                continue;
            }
            if self.queue.has_work() {
                self.grow(scope);
            }
            resolve(&future, self.execute(task));
        }
    }

    /// Starts one more helper thread unless the ceiling is reached.
    fn grow<'scope, 'env>(&'env self, scope: &'scope Scope<'scope, 'env>) {
        let mut threads = self.threads.lock();
        if *threads >= self.ceiling {
            return;
        }
        let index = *threads;
        let spawned = std::thread::Builder::new()
            .name(format!("distpool-local-{index}"))
            .spawn_scoped(scope, move || {
                if let Err(failure) = self.initialize() {
                    warn!("Initializer failed on helper thread {index}: {failure}");
                    return;
                }
                self.work(scope);
            });
        match spawned {
            Ok(_) => {
                *threads += 1;
                debug!("Started helper thread {index}");
            }
            Err(e) => warn!("Failed to start helper thread {index}: {e}"),
        }
    }

    fn execute(&self, task: Task) -> Outcome {
        match task {
            Task::Function(call) => self.registry.call(&call).into(),
            Task::Executable(exe) => self.launch(&exe),
        }
    }

    fn launch(&self, task: &ExecutableTask) -> Outcome {
        if task.num_workers() > self.ceiling {
            return Outcome::Failure(TaskFailure::capacity(task.num_workers(), self.ceiling));
        }
        let launcher = match self
            .launcher
            .get_or_init(|| GroupLauncher::new().map_err(|e| e.to_string()))
        {
            Ok(launcher) => launcher,
            Err(reason) => return Outcome::Failure(TaskFailure::new(FailureKind::Spawn, reason.clone())),
        };
        let finished = match launcher.launch(task) {
            Ok(group) => group.wait(),
            Err(PoolError::Spawn { reason, .. }) => Err(TaskFailure::new(FailureKind::Spawn, reason)),
            Err(e) => Err(TaskFailure::new(FailureKind::Spawn, e.to_string())),
        };
        match finished.and_then(|results| encode(&results).map_err(|e| TaskFailure::execution(e.to_string()))) {
            Ok(bytes) => Outcome::Value(bytes),
            Err(failure) => Outcome::Failure(failure),
        }
    }
}

fn resolve(future: &TaskFuture, outcome: Outcome) {
    let resolved = match outcome {
        Outcome::Value(bytes) => future.set_result(bytes),
        Outcome::Failure(failure) => future.set_failure(failure),
    };
    if resolved.is_err() {
        debug!("Discarding result of task {}", future.id());
    }
}
