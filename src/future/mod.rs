//! Single-assignment result cells.
//!
//! A [`TaskFuture`] moves through `Pending -> Running -> {Fulfilled, Failed,
//! Cancelled}`. Exactly one terminal transition ever happens; a second one is
//! rejected with `PoolError::AlreadyResolved`.

use crate::error::{PoolError, Result, TaskFailure};
use crate::task::{decode, TaskId};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of a [`TaskFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// Queued, not yet handed to a worker.
    Pending,
    /// Handed to a worker.
    Running,
    /// Resolved with a value.
    Fulfilled,
    /// Resolved with a failure.
    Failed,
    /// Cancelled before a value was accepted.
    Cancelled,
}

impl FutureState {
    /// Returns true for the three terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Failed | Self::Cancelled)
    }
}

type DoneCallback = Box<dyn FnOnce(&TaskFuture) + Send>;

struct Slot {
    state: FutureState,
    value: Option<Vec<u8>>,
    failure: Option<TaskFailure>,
    cancel_requested: bool,
    callbacks: Vec<DoneCallback>,
}

struct Shared {
    id: TaskId,
    program: Option<PathBuf>,
    slot: Mutex<Slot>,
    resolved: Condvar,
}

/// Handle to the eventual result of a submitted task.
///
/// Clones observe the same cell.
#[derive(Clone)]
pub struct TaskFuture {
    shared: Arc<Shared>,
}

impl TaskFuture {
    /// Creates a pending future for task `id`.
    #[must_use]
    pub fn new(id: TaskId) -> Self {
        Self::with_program(id, None)
    }

    pub(crate) fn with_program(id: TaskId, program: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                program,
                slot: Mutex::new(Slot {
                    state: FutureState::Pending,
                    value: None,
                    failure: None,
                    cancel_requested: false,
                    callbacks: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// ID of the task this future belongs to.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FutureState {
        self.shared.slot.lock().state
    }

    /// Returns true once a terminal state is reached.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Returns true if the future was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// Returns true while a worker holds the task.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == FutureState::Running
    }

    /// Attempts to cancel the task.
    ///
    /// A pending future becomes `Cancelled` and `true` is returned. Once the
    /// task is running the request is only recorded: the work may still
    /// complete, its result is discarded and the future ends `Cancelled`.
    pub fn cancel(&self) -> bool {
        let callbacks = {
            let mut slot = self.shared.slot.lock();
            match slot.state {
                FutureState::Pending => {
                    slot.state = FutureState::Cancelled;
                    std::mem::take(&mut slot.callbacks)
                }
                FutureState::Cancelled => return true,
                FutureState::Running => {
                    slot.cancel_requested = true;
                    return false;
                }
                FutureState::Fulfilled | FutureState::Failed => return false,
            }
        };
        self.shared.resolved.notify_all();
        self.run_callbacks(callbacks);
        true
    }

    /// Marks the future running, unless it was cancelled.
    ///
    /// Returns `false` when the task must not be executed.
    pub fn set_running_or_notify_cancel(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        match slot.state {
            FutureState::Pending => {
                slot.state = FutureState::Running;
                true
            }
            FutureState::Running => true,
            FutureState::Cancelled | FutureState::Fulfilled | FutureState::Failed => false,
        }
    }

    /// Resolves the future with an encoded value.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyResolved` if a terminal state was already set.
    pub fn set_result(&self, value: Vec<u8>) -> Result<()> {
        self.resolve(Ok(value))
    }

    /// Resolves the future with a failure.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyResolved` if a terminal state was already set.
    pub fn set_failure(&self, failure: TaskFailure) -> Result<()> {
        self.resolve(Err(failure))
    }

    fn resolve(&self, outcome: std::result::Result<Vec<u8>, TaskFailure>) -> Result<()> {
        let callbacks = {
            let mut slot = self.shared.slot.lock();
            if slot.state.is_terminal() {
                return Err(PoolError::AlreadyResolved);
            }
            if slot.cancel_requested {
                slot.state = FutureState::Cancelled;
            } else {
                match outcome {
                    Ok(value) => {
                        slot.state = FutureState::Fulfilled;
                        slot.value = Some(value);
                    }
                    Err(failure) => {
                        slot.state = FutureState::Failed;
                        slot.failure = Some(failure);
                    }
                }
            }
            std::mem::take(&mut slot.callbacks)
        };
        self.shared.resolved.notify_all();
        self.run_callbacks(callbacks);
        Ok(())
    }

    fn run_callbacks(&self, callbacks: Vec<DoneCallback>) {
        for callback in callbacks {
            callback(self);
        }
    }

    /// Runs `callback` once the future is done; immediately if it already is.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        {
            let mut slot = self.shared.slot.lock();
            if !slot.state.is_terminal() {
                slot.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Blocks until done or until `timeout` elapses. Returns true if done.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.shared.slot.lock();
        while !slot.state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.shared.resolved.wait_until(&mut slot, deadline).timed_out() {
                        return slot.state.is_terminal();
                    }
                }
                None => self.shared.resolved.wait(&mut slot),
            }
        }
        true
    }

    /// Failure of a failed future, without blocking.
    #[must_use]
    pub fn failure(&self) -> Option<TaskFailure> {
        self.shared.slot.lock().failure.clone()
    }

    /// Waits for the encoded value.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Timeout` if the deadline passes, `PoolError::Cancelled`
    /// for a cancelled future, and the captured failure for a failed one.
    pub fn raw_result(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if !self.wait(timeout) {
            return Err(PoolError::Timeout {
                timeout: timeout.unwrap_or_default(),
            });
        }
        let slot = self.shared.slot.lock();
        match slot.state {
            FutureState::Fulfilled => Ok(slot.value.clone().unwrap_or_default()),
            FutureState::Failed => Err(slot
                .failure
                .clone()
                .unwrap_or_else(|| TaskFailure::execution("failure missing"))
                .into_error(self.shared.program.clone())),
            FutureState::Cancelled => Err(PoolError::Cancelled),
            FutureState::Pending | FutureState::Running => Err(PoolError::Timeout {
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Waits for the value and decodes it as `T`.
    ///
    /// # Errors
    ///
    /// See [`TaskFuture::raw_result`]; additionally `PoolError::Codec` if the
    /// value is not a `T`.
    pub fn result<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T> {
        let value = self.raw_result(timeout)?;
        decode(&value)
    }
}

impl fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Yields futures in the order they finish.
///
/// Created by [`as_completed`].
pub struct AsCompleted {
    futures: Vec<Option<TaskFuture>>,
    remaining: usize,
    done: Receiver<usize>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

/// Iterates over `futures` in completion order.
///
/// The optional `timeout` bounds the whole iteration; when it expires the
/// iterator yields one `PoolError::Timeout` and then ends.
pub fn as_completed<I>(futures: I, timeout: Option<Duration>) -> AsCompleted
where
    I: IntoIterator<Item = TaskFuture>,
{
    let (tx, rx) = unbounded();
    let futures: Vec<Option<TaskFuture>> = futures.into_iter().map(Some).collect();
    for (index, future) in futures.iter().enumerate() {
        if let Some(future) = future {
            let tx = tx.clone();
            future.add_done_callback(move |_| {
                let _ = tx.send(index);
            });
        }
    }
    AsCompleted {
        remaining: futures.len(),
        futures,
        done: rx,
        deadline: timeout.map(|t| Instant::now() + t),
        timeout,
    }
}

impl AsCompleted {
    /// Futures not yet yielded.
    pub fn pending(&self) -> impl Iterator<Item = &TaskFuture> {
        self.futures.iter().flatten()
    }
}

impl Iterator for AsCompleted {
    type Item = Result<TaskFuture>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = match self.deadline {
            Some(deadline) => match self.done.recv_deadline(deadline) {
                Ok(index) => index,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    self.remaining = 0;
                    return Some(Err(PoolError::Timeout {
                        timeout: self.timeout.unwrap_or_default(),
                    }));
                }
            },
            None => match self.done.recv() {
                Ok(index) => index,
                Err(_) => {
                    self.remaining = 0;
                    return None;
                }
            },
        };
        self.remaining -= 1;
        self.futures.get_mut(index).and_then(Option::take).map(Ok)
    }
}
