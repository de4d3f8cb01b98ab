//! Public task-submission API.
//!
//! An [`Executor`] accepts tasks, hands back [`TaskFuture`]s and owns the
//! [`Pool`] that runs them. The pool is started lazily by the first call
//! that needs it.

pub mod local;
pub mod process;

use crate::config::{Clock, PollPolicy, PoolConfig, WorkerSetup};
use crate::error::{PoolError, Result};
use crate::fabric::Fabric;
use crate::future::{as_completed, AsCompleted, TaskFuture};
use crate::pool::Pool;
use crate::task::registry::FunctionRegistry;
use crate::task::{encode, FunctionTask, Task};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Default)]
struct State {
    pool: Option<Arc<Pool>>,
    closed: bool,
}

/// Runs tasks on a pool of workers.
///
/// Dropping the executor shuts it down and waits for running work.
///
/// # Example
///
/// ```
/// use distpool::executor::{Executor, MapOptions};
/// use distpool::task::registry::FunctionRegistry;
///
/// let mut registry = FunctionRegistry::new();
/// registry.register("abs", |x: i64| Ok::<_, String>(x.abs()));
///
/// let executor = Executor::builder().registry(registry).max_workers(2).build().unwrap();
/// let values: Vec<i64> = executor
///     .starmap("abs", [-1i64, 2, -3], MapOptions::default())
///     .unwrap()
///     .collect::<Result<_, _>>()
///     .unwrap();
/// assert_eq!(values, vec![1, 2, 3]);
/// ```
pub struct Executor {
    fabric: Option<Arc<dyn Fabric>>,
    registry: Arc<FunctionRegistry>,
    config: PoolConfig,
    state: Mutex<State>,
}

impl Executor {
    /// Creates an executor builder.
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Functions this executor can call.
    #[must_use]
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Starts the pool on first use.
    fn pool(&self, state: &mut State) -> Result<Arc<Pool>> {
        if state.closed {
            return Err(PoolError::Shutdown);
        }
        if let Some(pool) = &state.pool {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(Pool::start(
            self.fabric.clone(),
            Arc::clone(&self.registry),
            self.config.clone(),
        )?);
        state.pool = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn ready_timeout(&self) -> Duration {
        self.config.bootstrap_timeout.saturating_mul(2)
    }

    /// Number of workers in the pool, booting it if needed; 0 after shutdown.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Bootstrap` if the pool failed to start.
    pub fn num_workers(&self) -> Result<usize> {
        let pool = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(0);
            }
            self.pool(&mut state)?
        };
        pool.wait_ready(self.ready_timeout())
    }

    /// Queues `task` and returns its future.
    ///
    /// Tasks needing a single worker are queued without waiting for the
    /// pool to boot; once it has booted every task is checked against the
    /// workers left.
    ///
    /// # Errors
    ///
    /// - `PoolError::Shutdown` after [`Executor::shutdown`]
    /// - `PoolError::UnknownFunction` if the function is not registered
    /// - `PoolError::Capacity` if the task needs more workers than the pool has
    /// - `PoolError::Bootstrap` if the pool failed to start
    pub fn submit(&self, task: Task) -> Result<TaskFuture> {
        if self.state.lock().closed {
            return Err(PoolError::Shutdown);
        }
        if let Task::Function(call) = &task {
            self.registry.validate(call)?;
        }

        let needed = task.num_workers();
        let pool = self.pool(&mut self.state.lock())?;
        if needed > 1 || pool.is_ready() {
            let available = pool.wait_ready(self.ready_timeout())?;
            if needed > available {
                return Err(PoolError::Capacity {
                    requested: needed,
                    available,
                });
            }
        }

        // The lock is held across the push so a concurrent shutdown cannot
        // queue its sentinel ahead of this task.
        let mut state = self.state.lock();
        let pool = self.pool(&mut state)?;
        let future = TaskFuture::with_program(task.id(), task.program().map(Path::to_path_buf));
        pool.queue().push_work(future.clone(), task.copy());
        debug!("Task {} queued ({} waiting)", task.id(), pool.queue().pending_count());
        Ok(future)
    }

    /// Queues a call of the registered function `name` with `args`.
    ///
    /// # Errors
    ///
    /// See [`Executor::submit`]; also `PoolError::Codec` if `args` cannot be
    /// encoded.
    pub fn submit_function<A: Serialize + ?Sized>(&self, name: &str, args: &A) -> Result<TaskFuture> {
        self.submit(Task::function(name).args(args).build()?)
    }

    /// Calls `function` once per element of `args` and yields the results.
    ///
    /// Several arguments are passed as a tuple per element.
    ///
    /// # Errors
    ///
    /// Returns the first submission error; tasks already queued by this
    /// call are cancelled.
    pub fn starmap<A, R, I>(&self, function: &str, args: I, options: MapOptions) -> Result<MapResults<R>>
    where
        I: IntoIterator<Item = A>,
        A: Serialize,
        R: DeserializeOwned,
    {
        let mut calls = Vec::new();
        for arg in args {
            calls.push(FunctionTask::from_encoded(function, encode(&arg)?));
        }
        self.submit_all(calls, options)
    }

    /// Calls `function` with one element from each of `iterables` at a time.
    ///
    /// Stops at the shortest iterable. With several iterables the function
    /// receives a tuple with one element of each.
    ///
    /// # Errors
    ///
    /// See [`Executor::starmap`].
    pub fn map<T, R, I>(&self, function: &str, iterables: Vec<I>, options: MapOptions) -> Result<MapResults<R>>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
        R: DeserializeOwned,
    {
        let mut columns: Vec<I::IntoIter> = iterables.into_iter().map(IntoIterator::into_iter).collect();
        let mut calls = Vec::new();
        if !columns.is_empty() {
            'rows: loop {
                let mut args = Vec::new();
                for column in &mut columns {
                    let Some(value) = column.next() else {
                        break 'rows;
                    };
                    // A tuple encodes as its elements back to back.
                    args.extend(encode(&value)?);
                }
                calls.push(FunctionTask::from_encoded(function, args));
            }
        }
        self.submit_all(calls, options)
    }

    fn submit_all<R: DeserializeOwned>(&self, calls: Vec<FunctionTask>, options: MapOptions) -> Result<MapResults<R>> {
        let started = Instant::now();
        let mut futures = Vec::with_capacity(calls.len());
        for call in calls {
            match self.submit(call.into()) {
                Ok(future) => futures.push(future),
                Err(e) => {
                    for future in &futures {
                        future.cancel();
                    }
                    return Err(e);
                }
            }
        }
        debug!("Mapped {} calls", futures.len());
        Ok(MapResults::new(futures, options, started))
    }

    /// Stops accepting tasks and lets the pool wind down.
    ///
    /// With `cancel_futures`, queued tasks that have not started are
    /// cancelled. With `wait`, blocks until the pool has stopped. Calling
    /// this more than once is harmless.
    pub fn shutdown(&self, wait: bool, cancel_futures: bool) {
        let pool = {
            let mut state = self.state.lock();
            let first = !state.closed;
            state.closed = true;
            if let Some(pool) = &state.pool {
                if cancel_futures {
                    let cancelled = pool.queue().cancel();
                    debug!("Cancelled {cancelled} queued tasks");
                }
                if first {
                    info!("Shutting down executor");
                    pool.queue().push_shutdown();
                }
            }
            state.pool.clone()
        };

        if wait {
            if let Some(pool) = pool {
                pool.join();
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown(true, false);
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Executor")
            .field("fabric", &self.fabric.as_ref().map(|fabric| fabric.name()))
            .field("pool", &state.pool)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Executor`].
#[derive(Default)]
pub struct ExecutorBuilder {
    fabric: Option<Arc<dyn Fabric>>,
    registry: FunctionRegistry,
    initializer: Option<Task>,
    config: PoolConfig,
}

impl ExecutorBuilder {
    /// Sets the worker count, overriding capacity detection.
    #[must_use]
    pub const fn max_workers(mut self, count: usize) -> Self {
        self.config.max_workers = Some(count);
        self
    }

    /// Runs tasks on worker groups of `fabric` instead of local threads.
    #[must_use]
    pub fn fabric(mut self, fabric: Arc<dyn Fabric>) -> Self {
        self.fabric = Some(fabric);
        self
    }

    /// Sets the functions tasks may call.
    #[must_use]
    pub fn registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Runs `initializer` (a function task) once per worker before it accepts tasks.
    #[must_use]
    pub fn initializer(mut self, initializer: Task) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Sets the working directory, environment and path of worker processes.
    #[must_use]
    pub fn setup(mut self, setup: WorkerSetup) -> Self {
        self.config.setup = setup;
        self
    }

    /// Sets the polling policy of the pool's busy-wait loops.
    #[must_use]
    pub const fn poll(mut self, poll: PollPolicy) -> Self {
        self.config.poll = poll;
        self
    }

    /// Fails results that take longer than `timeout` and drops their worker.
    #[must_use]
    pub const fn result_timeout(mut self, timeout: Duration) -> Self {
        self.config.result_timeout = Some(timeout);
        self
    }

    /// Bounds the time allowed for booting the worker group.
    #[must_use]
    pub const fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.config.bootstrap_timeout = timeout;
        self
    }

    /// Bounds the wait for workers to receive the stop signal.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Sets the time source of the polling loops.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.config.clock = clock;
        self
    }

    /// Builds the executor. The pool starts on first use.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` for a zero worker count or an initializer
    /// that is not a function task, and `PoolError::UnknownFunction` if the
    /// initializer is not registered.
    pub fn build(mut self) -> Result<Executor> {
        if self.config.max_workers == Some(0) {
            return Err(PoolError::Config {
                reason: "max_workers must be at least 1".to_string(),
            });
        }

        self.config.initializer = match self.initializer {
            None => None,
            Some(Task::Function(call)) => {
                self.registry.validate(&call)?;
                Some(call)
            }
            Some(Task::Executable(_)) => {
                return Err(PoolError::Config {
                    reason: "initializer must be a function task".to_string(),
                })
            }
        };

        debug!("Built executor with {:?}", self.config);
        Ok(Executor {
            fabric: self.fabric,
            registry: Arc::new(self.registry),
            config: self.config,
            state: Mutex::new(State::default()),
        })
    }
}

/// How [`Executor::map`] and [`Executor::starmap`] yield results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Yield in submission order instead of completion order.
    pub ordered: bool,
    /// Bound on the whole iteration, counted from submission.
    pub timeout: Option<Duration>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            timeout: None,
        }
    }
}

impl MapOptions {
    /// Yields results as they complete.
    #[must_use]
    pub const fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }

    /// Bounds the whole iteration.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

enum Order {
    Submission(VecDeque<TaskFuture>),
    Completion(AsCompleted),
}

/// Lazy results of a map call.
///
/// Yields one `Result<R>` per call. When the timeout expires it yields a
/// single `PoolError::Timeout`, cancels every unfinished call and ends.
/// Dropping it early cancels the calls not yet yielded.
pub struct MapResults<R> {
    order: Order,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    finished: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> MapResults<R> {
    fn new(futures: Vec<TaskFuture>, options: MapOptions, started: Instant) -> Self {
        let deadline = options.timeout.map(|t| started + t);
        let order = if options.ordered {
            Order::Submission(futures.into())
        } else {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            Order::Completion(as_completed(futures, remaining))
        };
        Self {
            order,
            deadline,
            timeout: options.timeout,
            finished: false,
            _marker: PhantomData,
        }
    }

    /// Futures of the calls not yet yielded.
    #[must_use]
    pub fn remaining(&self) -> Vec<TaskFuture> {
        match &self.order {
            Order::Submission(futures) => futures.iter().cloned().collect(),
            Order::Completion(completed) => completed.pending().cloned().collect(),
        }
    }

    fn expire(&mut self) -> PoolError {
        self.finished = true;
        let cancelled = self.remaining().iter().filter(|future| future.cancel()).count();
        debug!("Map timed out, cancelled {cancelled} calls");
        if let Order::Submission(futures) = &mut self.order {
            futures.clear();
        }
        PoolError::Timeout {
            timeout: self.timeout.unwrap_or_default(),
        }
    }
}

impl<R: DeserializeOwned> Iterator for MapResults<R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let remaining = self.deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let future = match &mut self.order {
            Order::Submission(futures) => {
                let future = futures.front()?.clone();
                if !future.wait(remaining) {
                    return Some(Err(self.expire()));
                }
                futures.pop_front();
                future
            }
            Order::Completion(completed) => match completed.next()? {
                Ok(future) => future,
                Err(PoolError::Timeout { .. }) => return Some(Err(self.expire())),
                Err(e) => return Some(Err(e)),
            },
        };
        Some(future.result(None))
    }
}

impl<R> Drop for MapResults<R> {
    fn drop(&mut self) {
        match &self.order {
            Order::Submission(futures) => futures.iter().for_each(|future| {
                future.cancel();
            }),
            Order::Completion(completed) => completed.pending().for_each(|future| {
                future.cancel();
            }),
        }
    }
}
