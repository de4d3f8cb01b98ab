//! Message-passing fabric between the producer and its workers.
//!
//! The pool only relies on non-blocking point-to-point primitives: a
//! producer-side [`Communicator`] addressing workers by rank, a worker-side
//! [`Link`] back to the producer, and [`ProcessGroup`]s for executables.
//! Collective steps (setup broadcast, initializer reduction) are built from
//! these primitives by the protocol engines.

pub mod memory;
pub mod tcp;

use crate::config::{PoolConfig, WorkerSetup};
use crate::error::{PoolError, Result, TaskFailure};
use crate::task::registry::{CallOutcome, FunctionRegistry};
use crate::task::{ExecutableTask, ExecutionResult, FunctionTask, Task};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Index of a worker inside its group.
pub type Rank = usize;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Startup state broadcast to every worker before it accepts tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Environment and directory adjustments.
    pub setup: WorkerSetup,
    /// Function run once per worker; the group aborts if any run fails.
    pub initializer: Option<FunctionTask>,
    /// Name of the producer's program; workers must run the same one.
    pub program: Option<String>,
}

/// Result half of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Encoded value.
    Value(Vec<u8>),
    /// Failure captured on the worker.
    Failure(TaskFailure),
}

impl From<CallOutcome> for Outcome {
    fn from(outcome: CallOutcome) -> Self {
        match outcome {
            Ok(value) => Self::Value(value),
            Err(failure) => Self::Failure(failure),
        }
    }
}

/// Wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First frame of a worker, identifying its rank.
    Hello {
        /// Worker rank.
        rank: Rank,
    },
    /// Producer → workers: startup state.
    Setup(Handshake),
    /// Worker → producer: initializer result.
    Ready {
        /// Whether setup and initializer succeeded.
        initialized: bool,
    },
    /// Producer → workers: reduced initializer result.
    Proceed {
        /// True when every worker initialized.
        start: bool,
    },
    /// Producer → worker: a task to execute.
    Task(Task),
    /// Worker → producer: the task's outcome.
    Outcome(Outcome),
    /// Producer → worker: stop.
    Shutdown,
}

/// Item taken off a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A decoded message.
    Message(Message),
    /// A frame arrived but did not decode.
    Undecodable(String),
}

/// Encodes a message into a frame body.
///
/// # Errors
///
/// Returns `PoolError::Codec` if encoding fails or the frame is too large.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(PoolError::Codec(format!("Frame too large: {} bytes", bytes.len())));
    }
    Ok(bytes)
}

/// Decodes a frame body; a bad frame is reported, not raised.
#[must_use]
pub fn decode_frame(bytes: &[u8]) -> Received {
    match bincode::deserialize(bytes) {
        Ok(message) => Received::Message(message),
        Err(e) => Received::Undecodable(e.to_string()),
    }
}

/// Name identifying a worker program, compared during the handshake.
#[must_use]
pub fn program_name(path: &Path) -> Option<String> {
    path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
}

/// Name of the program this process runs.
#[must_use]
pub fn current_program() -> Option<String> {
    std::env::current_exe().ok().as_deref().and_then(program_name)
}

/// Result of polling a peer's channel once.
pub(crate) enum Delivery {
    Frame(Vec<u8>),
    Empty,
    Closed,
}

/// Receive side of one peer on the producer: frames peeked by `iprobe`
/// wait here until `recv` takes them, and a lost peer is reported once.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    buffered: VecDeque<Received>,
    lost: bool,
    loss_reported: bool,
}

impl Mailbox {
    /// Buffers at most one frame from `poll`.
    pub(crate) fn fill(&mut self, poll: impl FnOnce() -> Delivery) {
        if !self.buffered.is_empty() || self.lost {
            return;
        }
        match poll() {
            Delivery::Frame(frame) => self.buffered.push_back(decode_frame(&frame)),
            Delivery::Empty => {}
            Delivery::Closed => self.lost = true,
        }
    }

    pub(crate) fn has_news(&self) -> bool {
        !self.buffered.is_empty() || (self.lost && !self.loss_reported)
    }

    /// Takes the next item, blocking on `wait` when nothing is buffered.
    ///
    /// Returns `None` once the peer is gone.
    pub(crate) fn take(&mut self, wait: impl FnOnce() -> Option<Vec<u8>>) -> Option<Received> {
        if let Some(received) = self.buffered.pop_front() {
            return Some(received);
        }
        if !self.lost {
            if let Some(frame) = wait() {
                return Some(decode_frame(&frame));
            }
            self.lost = true;
        }
        self.loss_reported = true;
        None
    }
}

const SEND_PENDING: u8 = 0;
const SEND_DELIVERED: u8 = 1;
const SEND_FAILED: u8 = 2;

/// Completion handle of a non-blocking send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    state: Arc<AtomicU8>,
}

impl SendRequest {
    /// Creates an outstanding request.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(SEND_PENDING)),
        }
    }

    /// Creates a request that is already complete.
    #[must_use]
    pub fn delivered() -> Self {
        let request = Self::new();
        request.complete();
        request
    }

    /// Marks the message as delivered.
    pub fn complete(&self) {
        let _ = self
            .state
            .compare_exchange(SEND_PENDING, SEND_DELIVERED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Marks the send as failed.
    pub fn fail(&self) {
        let _ = self
            .state
            .compare_exchange(SEND_PENDING, SEND_FAILED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Tests for completion without blocking.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the transport gave up on the message.
    pub fn test(&self) -> Result<bool> {
        match self.state.load(Ordering::Acquire) {
            SEND_DELIVERED => Ok(true),
            SEND_FAILED => Err(PoolError::Transport {
                rank: None,
                reason: "send failed".to_string(),
            }),
            _ => Ok(false),
        }
    }
}

impl Default for SendRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer-side view of the worker group.
///
/// Owned by exactly one protocol engine; `&mut self` on every call
/// serializes all transport access.
pub trait Communicator: Send {
    /// Number of workers in the remote group.
    fn remote_size(&self) -> usize;

    /// Starts sending `message` to worker `dest`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if `dest` is unreachable.
    fn isend(&mut self, dest: Rank, message: &Message) -> Result<SendRequest>;

    /// Returns the rank of a worker with something to receive, if any.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the fabric itself failed.
    fn iprobe(&mut self) -> Result<Option<Rank>>;

    /// Receives the next item from `source`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Transport` with the rank when the worker is gone.
    fn recv(&mut self, source: Rank) -> Result<Received>;

    /// Releases the group.
    ///
    /// # Errors
    ///
    /// Returns an error if workers could not be reaped cleanly.
    fn disconnect(&mut self) -> Result<()>;
}

/// Worker-side view of the producer.
pub trait Link: Send {
    /// This worker's rank.
    fn rank(&self) -> Rank;

    /// Takes the next incoming item without blocking.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the producer is gone.
    fn try_recv(&mut self) -> Result<Option<Received>>;

    /// Starts sending `message` to the producer.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the producer is gone.
    fn isend(&mut self, message: &Message) -> Result<SendRequest>;

    /// Disconnects from the producer.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection could not be closed cleanly.
    fn disconnect(&mut self) -> Result<()>;
}

/// Final state of a process group: one result per member, or why it failed.
pub type GroupOutcome = std::result::Result<Vec<ExecutionResult>, TaskFailure>;

/// A running group of processes launched for an executable task.
pub trait ProcessGroup: Send {
    /// Returns the outcome once every member exited.
    fn try_wait(&mut self) -> Option<GroupOutcome>;

    /// Terminates every member still running.
    fn kill(&mut self);
}

/// Source of workers and process groups.
pub trait Fabric: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Worker slots available to this producer, if the fabric knows.
    fn spare_capacity(&self) -> Option<usize>;

    /// Program the workers must be running, checked during the handshake.
    fn worker_program(&self) -> Option<String> {
        None
    }

    /// Spawns a group of `count` workers and connects to it.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Bootstrap` if the group cannot be established.
    fn spawn_workers(
        &self,
        count: usize,
        registry: &Arc<FunctionRegistry>,
        config: &PoolConfig,
    ) -> Result<Box<dyn Communicator>>;

    /// Launches a fresh process group for an executable task.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Spawn` if any member fails to start.
    fn launch_group(&self, task: &ExecutableTask) -> Result<Box<dyn ProcessGroup>>;
}
