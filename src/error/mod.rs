//! Error types for distpool.
//!
//! Errors local to the caller (capacity, shutdown, timeout) are returned
//! synchronously as [`PoolError`]. Errors that happen on the far side of the
//! fabric travel back as a [`TaskFailure`] value and are turned into a
//! `PoolError` when the owning future is awaited.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for distpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Every failure mode of the pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The worker group could not be established.
    #[error("Worker group could not be established: {reason}")]
    Bootstrap {
        /// Why booting failed.
        reason: String,
    },

    /// A task asked for more workers than the pool has.
    #[error("Task requests {requested} workers but the pool has {available}")]
    Capacity {
        /// Workers requested by the task.
        requested: usize,
        /// Workers currently in the pool.
        available: usize,
    },

    /// Launching the process group of an executable task failed.
    #[error("Failed to spawn {program}: {reason}")]
    Spawn {
        /// Program that was being launched.
        program: PathBuf,
        /// Spawn failure detail.
        reason: String,
    },

    /// The executor no longer accepts work.
    #[error("Cannot submit tasks after shutdown")]
    Shutdown,

    /// A deadline expired before the result was available.
    #[error("Timed out after {timeout:?}")]
    Timeout {
        /// The deadline that expired.
        timeout: Duration,
    },

    /// The task body itself failed.
    #[error("Task execution failed: {0}")]
    Execution(TaskFailure),

    /// The communication layer failed.
    #[error("Transport failure{}: {reason}", worker_suffix(.rank))]
    Transport {
        /// Worker rank involved, if known.
        rank: Option<usize>,
        /// Failure detail.
        reason: String,
    },

    /// The future was cancelled before producing a result.
    #[error("Task was cancelled")]
    Cancelled,

    /// A future was resolved twice.
    #[error("Future is already resolved")]
    AlreadyResolved,

    /// No function with this name is registered.
    #[error("Unknown function: {name}")]
    UnknownFunction {
        /// Requested function name.
        name: String,
    },

    /// Invalid task configuration.
    #[error("Invalid task configuration: {reason}")]
    InvalidTask {
        /// Reason why the task is invalid.
        reason: String,
    },

    /// Invalid executor configuration.
    #[error("Invalid configuration: {reason}")]
    Config {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// A value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[allow(clippy::ref_option)]
fn worker_suffix(rank: &Option<usize>) -> String {
    rank.map(|r| format!(" on worker {r}")).unwrap_or_default()
}

impl From<bincode::Error> for PoolError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Category of a [`TaskFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The task body returned an error or panicked.
    Execution,
    /// The task could not be decoded by the worker.
    Decode,
    /// The process group for an executable could not be launched.
    Spawn,
    /// The worker was lost or stopped answering.
    Transport,
    /// The task could not fit in the remaining workers.
    Capacity,
    /// The pool never came up.
    Bootstrap,
}

/// A failure that can cross a process boundary.
///
/// Carried inside every response message in place of a raised error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
    /// Optional encoded detail supplied by the failing side.
    pub payload: Option<Vec<u8>>,
}

impl TaskFailure {
    /// Creates a failure without payload.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: None,
        }
    }

    /// Shorthand for an execution failure.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Execution, message)
    }

    /// Shorthand for a transport failure.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    /// A capacity failure discovered after submission (workers were lost).
    #[must_use]
    pub fn capacity(requested: usize, available: usize) -> Self {
        let failure = Self::new(
            FailureKind::Capacity,
            format!("task requests {requested} workers but only {available} remain"),
        );
        match bincode::serialize(&(requested, available)) {
            Ok(payload) => failure.with_payload(payload),
            Err(_) => failure,
        }
    }

    /// Attaches an encoded payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Converts into the caller-facing error for a given task context.
    #[must_use]
    pub fn into_error(self, program: Option<PathBuf>) -> PoolError {
        match self.kind {
            FailureKind::Execution | FailureKind::Decode => PoolError::Execution(self),
            FailureKind::Spawn => PoolError::Spawn {
                program: program.unwrap_or_default(),
                reason: self.message,
            },
            FailureKind::Transport => PoolError::Transport {
                rank: None,
                reason: self.message,
            },
            FailureKind::Capacity => match self
                .payload
                .as_deref()
                .and_then(|bytes| bincode::deserialize::<(usize, usize)>(bytes).ok())
            {
                Some((requested, available)) => PoolError::Capacity {
                    requested,
                    available,
                },
                None => PoolError::InvalidTask {
                    reason: self.message,
                },
            },
            FailureKind::Bootstrap => PoolError::Bootstrap {
                reason: self.message,
            },
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
