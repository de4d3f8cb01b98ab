//! Pool lifecycle.
//!
//! A [`Pool`] owns the [`WorkQueue`] and a manager thread. The manager
//! decides once how work is executed: by a worker group on a [`Fabric`]
//! driven by a [`ClientWorker`], or by the in-process [`LocalThreadPool`]
//! when no more than one worker is available.
//!
//! A process spawned by a fabric takes the other role: it calls
//! [`run_worker_if_spawned`] at the top of `main` and serves tasks until the
//! producer tells it to stop.

pub mod client;
pub mod server;

use crate::config::PoolConfig;
use crate::error::{FailureKind, PoolError, Result, TaskFailure};
use crate::executor::local::LocalThreadPool;
use crate::fabric::tcp::{TcpLink, PARENT_ADDR_ENV, WORKER_COUNT_ENV, WORKER_RANK_ENV};
use crate::fabric::{Fabric, Handshake, Rank};
use crate::queue::{Entry, WorkQueue};
use crate::task::registry::FunctionRegistry;
use client::ClientWorker;
use parking_lot::{Condvar, Mutex};
use server::ServerWorker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Which side of the protocol a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the queue and dispatches tasks.
    Producer,
    /// Executes tasks dispatched by a producer.
    Worker,
}

impl Role {
    /// Role of the current process, decided by the spawn environment.
    #[must_use]
    pub fn current() -> Self {
        if std::env::var_os(PARENT_ADDR_ENV).is_some() {
            Self::Worker
        } else {
            Self::Producer
        }
    }
}

/// One side of the pool protocol, run to completion on its own thread.
pub trait ProtocolEngine {
    /// Side of the protocol this engine implements.
    fn role(&self) -> Role;

    /// Runs the engine until the protocol ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    fn run(self: Box<Self>) -> Result<()>;
}

/// Connection details handed to a spawned worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedWorker {
    /// Address of the producer's listener.
    pub parent: String,
    /// Rank of this worker.
    pub rank: Rank,
    /// Size of the worker group.
    pub count: usize,
}

impl SpawnedWorker {
    /// Reads the spawn environment of the current process.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Bootstrap` if the environment is incomplete.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(parent) = lookup(PARENT_ADDR_ENV) else {
            return Ok(None);
        };
        let number = |name: &str| -> Result<usize> {
            lookup(name)
                .and_then(|raw| raw.trim().parse().ok())
                .ok_or_else(|| PoolError::Bootstrap {
                    reason: format!("{name} is missing or not a number"),
                })
        };
        let rank = number(WORKER_RANK_ENV)?;
        let count = number(WORKER_COUNT_ENV)?;
        if rank >= count {
            return Err(PoolError::Bootstrap {
                reason: format!("Worker rank {rank} outside a group of {count}"),
            });
        }
        Ok(Some(Self {
            parent,
            rank,
            count,
        }))
    }
}

/// Serves tasks if this process was spawned as a worker, then exits.
///
/// Returns immediately in the producer. Call this first thing in `main`
/// of every program used as a worker program, after registering functions.
pub fn run_worker_if_spawned(registry: &FunctionRegistry) {
    let spawned = match SpawnedWorker::from_env() {
        Ok(Some(spawned)) => spawned,
        Ok(None) => return,
        Err(e) => {
            error!("Cannot start as worker: {e}");
            std::process::exit(2);
        }
    };

    let code = match serve_as_worker(&spawned, registry) {
        Ok(()) => 0,
        Err(e) => {
            error!("Worker {} failed: {e}", spawned.rank);
            1
        }
    };
    std::process::exit(code);
}

/// Connects to the producer and serves tasks until told to stop.
///
/// # Errors
///
/// Returns an error if the producer cannot be reached or goes away.
pub fn serve_as_worker(spawned: &SpawnedWorker, registry: &FunctionRegistry) -> Result<()> {
    info!(
        "Worker {}/{} connecting to {}",
        spawned.rank, spawned.count, spawned.parent
    );
    let link = TcpLink::connect(&spawned.parent, spawned.rank)?;
    let engine: Box<dyn ProtocolEngine> = Box::new(ServerWorker::new(link, Arc::new(registry.clone())));
    debug_assert_eq!(engine.role(), Role::Worker);
    engine.run()
}

/// Outcome of booting, published once by the manager.
#[derive(Default)]
struct Readiness {
    state: Mutex<Option<std::result::Result<(), String>>>,
    changed: Condvar,
}

impl Readiness {
    fn set(&self, outcome: std::result::Result<(), String>) {
        *self.state.lock() = Some(outcome);
        self.changed.notify_all();
    }

    fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), Some(Ok(())))
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match &*state {
                Some(Ok(())) => return Ok(()),
                Some(Err(reason)) => {
                    return Err(PoolError::Bootstrap {
                        reason: reason.clone(),
                    })
                }
                None => {}
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() && state.is_none() {
                return Err(PoolError::Bootstrap {
                    reason: format!("Pool did not start within {timeout:?}"),
                });
            }
        }
    }
}

/// Owner of the work queue and the manager thread.
pub struct Pool {
    queue: WorkQueue,
    readiness: Arc<Readiness>,
    workers: Arc<AtomicUsize>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Starts the manager thread.
    ///
    /// Without a fabric, tasks run on a [`LocalThreadPool`].
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Bootstrap` if the manager thread cannot start.
    pub fn start(
        fabric: Option<Arc<dyn Fabric>>,
        registry: Arc<FunctionRegistry>,
        config: PoolConfig,
    ) -> Result<Self> {
        let queue = WorkQueue::new();
        let readiness = Arc::new(Readiness::default());
        let workers = Arc::new(AtomicUsize::new(0));
        let manager = Manager {
            fabric,
            registry,
            config,
            queue: queue.clone(),
            readiness: Arc::clone(&readiness),
            workers: Arc::clone(&workers),
        };

        let handle = std::thread::Builder::new()
            .name("distpool-manager".to_string())
            .spawn(move || manager.run())
            .map_err(|e| PoolError::Bootstrap {
                reason: format!("Failed to start manager thread: {e}"),
            })?;

        Ok(Self {
            queue,
            readiness,
            workers,
            manager: Mutex::new(Some(handle)),
        })
    }

    /// The queue consumed by the manager.
    #[must_use]
    pub const fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Blocks until the pool has booted and returns its worker count.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Bootstrap` if booting failed or took longer than
    /// `timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> Result<usize> {
        self.readiness.wait(timeout)?;
        Ok(self.size())
    }

    /// Returns true once the pool has booted successfully.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Workers currently in the pool; 0 before booting finished.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Waits for the manager thread to finish.
    ///
    /// The manager only finishes after it consumed a shutdown sentinel.
    pub fn join(&self) {
        let handle = self.manager.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Pool manager panicked");
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

struct Manager {
    fabric: Option<Arc<dyn Fabric>>,
    registry: Arc<FunctionRegistry>,
    config: PoolConfig,
    queue: WorkQueue,
    readiness: Arc<Readiness>,
    workers: Arc<AtomicUsize>,
}

impl Manager {
    fn run(self) {
        let Some(fabric) = self.fabric.clone() else {
            let ceiling = self.config.resolved_max_workers().unwrap_or_else(num_cpus::get);
            self.run_local(ceiling);
            return;
        };

        let size = self
            .config
            .resolved_max_workers()
            .or_else(|| fabric.spare_capacity())
            .unwrap_or(1)
            .max(1);
        if size == 1 {
            info!("The {} fabric offers one worker; running tasks in-process", fabric.name());
            self.run_local(1);
            return;
        }

        match self.boot(&fabric, size) {
            Ok(client) => {
                self.readiness.set(Ok(()));
                let engine: Box<dyn ProtocolEngine> = Box::new(client);
                if let Err(e) = engine.run() {
                    error!("Producer stopped: {e}");
                    self.workers.store(0, Ordering::SeqCst);
                    self.fail_until_shutdown(&TaskFailure::transport(e.to_string()));
                }
            }
            Err(e) => {
                error!("Failed to start worker group: {e}");
                self.workers.store(0, Ordering::SeqCst);
                let reason = bootstrap_reason(e);
                self.readiness.set(Err(reason.clone()));
                self.fail_until_shutdown(&TaskFailure::new(FailureKind::Bootstrap, reason));
            }
        }
        debug!("Pool manager finished");
    }

    fn boot(&self, fabric: &Arc<dyn Fabric>, size: usize) -> Result<ClientWorker> {
        info!("Spawning {size} workers on the {} fabric", fabric.name());
        let comm = fabric.spawn_workers(size, &self.registry, &self.config)?;
        let mut client = ClientWorker::new(
            comm,
            self.queue.clone(),
            self.config.clone(),
            Arc::clone(&self.workers),
        )
        .with_fabric(Arc::clone(fabric));

        let handshake = Handshake {
            setup: self.config.setup.clone(),
            initializer: self.config.initializer.clone(),
            program: fabric.worker_program(),
        };
        client.handshake(&handshake, self.config.bootstrap_timeout)?;
        info!("Worker group of {} ready", client.total());
        Ok(client)
    }

    fn run_local(&self, ceiling: usize) {
        let pool = LocalThreadPool::new(
            self.queue.clone(),
            Arc::clone(&self.registry),
            self.config.clone(),
            ceiling,
        );
        let outcome = pool.run(|size| {
            self.workers.store(size, Ordering::SeqCst);
            self.readiness.set(Ok(()));
        });
        if let Err(e) = outcome {
            error!("Local pool failed to start: {e}");
            let reason = bootstrap_reason(e);
            self.readiness.set(Err(reason.clone()));
            self.fail_until_shutdown(&TaskFailure::new(FailureKind::Bootstrap, reason));
        }
    }

    /// Fails every queued task with `failure` until the sentinel arrives.
    fn fail_until_shutdown(&self, failure: &TaskFailure) {
        let mut backoff = self.config.poll.backoff();
        loop {
            match self.queue.pop() {
                Some(Entry::Shutdown) => break,
                Some(Entry::Work(future, task)) => {
                    backoff.reset();
                    if future.set_running_or_notify_cancel() {
                        warn!("Failing task {}: {}", task.id(), failure.message);
                        let _ = future.set_failure(failure.clone());
                    }
                }
                None => backoff.wait(&*self.config.clock),
            }
        }
    }
}

fn bootstrap_reason(error: PoolError) -> String {
    match error {
        PoolError::Bootstrap { reason } => reason,
        other => other.to_string(),
    }
}
