//! Consumer-side protocol engine.
//!
//! A [`ServerWorker`] runs once per worker: it takes part in the startup
//! handshake, then executes one task at a time until told to stop.

use crate::config::{Clock, PollPolicy, SystemClock};
use crate::error::{FailureKind, PoolError, Result, TaskFailure};
use crate::fabric::{current_program, Handshake, Link, Message, Outcome, Received, SendRequest};
use crate::pool::{ProtocolEngine, Role};
use crate::task::registry::FunctionRegistry;
use crate::task::Task;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the handshake's [`WorkerSetup`](crate::config::WorkerSetup) applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupScope {
    /// The worker owns its process and applies the setup to it.
    Process,
    /// The worker shares the producer's process; the setup is left alone.
    Shared,
}

/// Executes tasks received over a [`Link`].
pub struct ServerWorker<L: Link> {
    link: L,
    registry: Arc<FunctionRegistry>,
    poll: PollPolicy,
    clock: Arc<dyn Clock>,
    scope: SetupScope,
}

impl<L: Link> ServerWorker<L> {
    /// Creates a worker for `link`.
    #[must_use]
    pub fn new(link: L, registry: Arc<FunctionRegistry>) -> Self {
        Self {
            link,
            registry,
            poll: PollPolicy::default(),
            clock: Arc::new(SystemClock),
            scope: SetupScope::Process,
        }
    }

    /// Sets the polling policy.
    #[must_use]
    pub const fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the clock used while polling.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets where the startup setup applies.
    #[must_use]
    pub const fn with_scope(mut self, scope: SetupScope) -> Self {
        self.scope = scope;
        self
    }

    /// Runs the handshake, serves tasks, then disconnects.
    ///
    /// Task failures are reported to the producer; only transport errors
    /// end the worker early.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the producer becomes unreachable.
    pub fn run(mut self) -> Result<()> {
        let rank = self.link.rank();
        let served = match self.handshake() {
            Ok(true) => self.serve(),
            Ok(false) => {
                info!("Worker {rank} released before accepting tasks");
                Ok(())
            }
            Err(e) => Err(e),
        };
        let disconnected = self.link.disconnect();
        served.and(disconnected)
    }

    fn next_message(&mut self) -> Result<Received> {
        let mut backoff = self.poll.backoff();
        loop {
            if let Some(received) = self.link.try_recv()? {
                return Ok(received);
            }
            backoff.wait(&*self.clock);
        }
    }

    fn await_delivery(&self, request: &SendRequest) -> Result<()> {
        let mut backoff = self.poll.backoff();
        while !request.test()? {
            backoff.wait(&*self.clock);
        }
        Ok(())
    }

    /// Returns whether the group agreed to start.
    fn handshake(&mut self) -> Result<bool> {
        let rank = self.link.rank();
        let handshake = match self.next_message()? {
            Received::Message(Message::Setup(handshake)) => handshake,
            Received::Message(Message::Shutdown) => return Ok(false),
            other => {
                return Err(PoolError::Bootstrap {
                    reason: format!("Worker {rank} expected setup, got {other:?}"),
                })
            }
        };

        let initialized = self.initialize(&handshake);
        let request = self.link.isend(&Message::Ready { initialized })?;
        self.await_delivery(&request)?;

        match self.next_message()? {
            Received::Message(Message::Proceed { start }) => Ok(start),
            Received::Message(Message::Shutdown) => Ok(false),
            other => Err(PoolError::Bootstrap {
                reason: format!("Worker {rank} expected proceed, got {other:?}"),
            }),
        }
    }

    fn initialize(&self, handshake: &Handshake) -> bool {
        let rank = self.link.rank();
        if self.scope == SetupScope::Process && !handshake.setup.is_empty() {
            if let Err(e) = handshake.setup.apply() {
                warn!("Worker {rank} failed to apply setup: {e}");
                return false;
            }
        }

        if let Some(expected) = &handshake.program {
            let actual = current_program();
            if actual.as_deref() != Some(expected.as_str()) {
                warn!("Worker {rank} runs {actual:?}, producer expects {expected}");
                return false;
            }
        }

        if let Some(initializer) = &handshake.initializer {
            if let Err(failure) = self.registry.call(initializer) {
                warn!("Initializer {} failed on worker {rank}: {failure}", initializer.name());
                return false;
            }
        }
        true
    }

    fn serve(&mut self) -> Result<()> {
        let rank = self.link.rank();
        debug!("Worker {rank} accepting tasks");
        let mut backoff = self.poll.backoff();
        loop {
            let Some(received) = self.link.try_recv()? else {
                backoff.wait(&*self.clock);
                continue;
            };
            backoff.reset();

            let outcome = match received {
                Received::Message(Message::Shutdown) => {
                    debug!("Worker {rank}: received end signal");
                    break;
                }
                Received::Message(Message::Task(task)) => self.execute(task),
                Received::Undecodable(reason) => {
                    warn!("Worker {rank} could not decode a task: {reason}");
                    Outcome::Failure(TaskFailure::new(FailureKind::Decode, reason))
                }
                Received::Message(other) => {
                    warn!("Worker {rank} ignoring unexpected {other:?}");
                    continue;
                }
            };

            let request = self.link.isend(&Message::Outcome(outcome))?;
            self.await_delivery(&request)?;
        }
        Ok(())
    }

    fn execute(&self, task: Task) -> Outcome {
        let rank = self.link.rank();
        match task {
            Task::Function(call) => {
                debug!("Executing task {} ({}) on worker {rank}", call.id(), call.name());
                self.registry.call(&call).into()
            }
            Task::Executable(exe) => {
                warn!("Worker {rank} received executable task {}", exe.id());
                Outcome::Failure(TaskFailure::new(
                    FailureKind::Spawn,
                    "Executable tasks are launched by the producer",
                ))
            }
        }
    }
}

impl<L: Link> ProtocolEngine for ServerWorker<L> {
    fn role(&self) -> Role {
        Role::Worker
    }

    fn run(self: Box<Self>) -> Result<()> {
        (*self).run()
    }
}
