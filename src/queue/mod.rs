//! Shared queue between submitters and the pool's consumers.
//!
//! Entries are pushed at the front and popped from the back, so work is
//! handed out in submission order. The [`Entry::Shutdown`] sentinel is
//! re-pushed by whoever pops it while other consumers or queued work remain.

use crate::error::TaskFailure;
use crate::future::TaskFuture;
use crate::task::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// One queued item.
#[derive(Debug)]
pub enum Entry {
    /// A task and the future it resolves.
    Work(TaskFuture, Task),
    /// No more work will arrive.
    Shutdown,
}

impl Entry {
    /// Returns true for the shutdown sentinel.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Thread-safe double-ended work queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    entries: Arc<Mutex<VecDeque<Entry>>>,
}

impl WorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an entry behind everything already queued.
    pub fn push(&self, entry: Entry) {
        self.entries.lock().push_front(entry);
    }

    /// Enqueues a task with its future.
    pub fn push_work(&self, future: TaskFuture, task: Task) {
        self.push(Entry::Work(future, task));
    }

    /// Enqueues the shutdown sentinel.
    pub fn push_shutdown(&self) {
        self.push(Entry::Shutdown);
    }

    /// Takes the oldest entry.
    #[must_use]
    pub fn pop(&self) -> Option<Entry> {
        self.entries.lock().pop_back()
    }

    /// Number of queued entries, sentinel included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of queued tasks, sentinel excluded.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| !e.is_shutdown()).count()
    }

    /// Returns true if any task is queued.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.entries.lock().iter().any(|e| !e.is_shutdown())
    }

    /// Takes the oldest task accepted by `eligible`, or the sentinel once no
    /// task is queued ahead of it.
    ///
    /// Rejected tasks keep their place in line.
    pub fn pop_where<F>(&self, mut eligible: F) -> Option<Entry>
    where
        F: FnMut(&TaskFuture, &Task) -> bool,
    {
        let mut entries = self.entries.lock();
        let mut skipped = false;
        let from_back = entries.iter().rev().position(|entry| match entry {
            Entry::Work(future, task) => {
                let take = eligible(future, task);
                skipped |= !take;
                take
            }
            Entry::Shutdown => !skipped,
        })?;
        let index = entries.len() - 1 - from_back;
        entries.remove(index)
    }

    /// Drains every queued task, handing each future to `handler`.
    ///
    /// A queued sentinel stays queued. Returns the number of drained tasks.
    pub fn drain_with<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(TaskFuture),
    {
        let futures: Vec<TaskFuture> = {
            let mut entries = self.entries.lock();
            let mut sentinel = false;
            let futures = entries
                .drain(..)
                .filter_map(|entry| match entry {
                    Entry::Work(future, _task) => Some(future),
                    Entry::Shutdown => {
                        sentinel = true;
                        None
                    }
                })
                .collect();
            if sentinel {
                entries.push_front(Entry::Shutdown);
            }
            futures
        };

        // Handlers run outside the lock: they may fire future callbacks.
        let drained = futures.len();
        for future in futures {
            handler(future);
        }
        if drained > 0 {
            debug!("Drained {drained} queued tasks");
        }
        drained
    }

    /// Cancels every queued task that has not been dispatched.
    pub fn cancel(&self) -> usize {
        self.drain_with(|future| {
            future.cancel();
        })
    }

    /// Fails every queued task with `failure`.
    pub fn fail(&self, failure: &TaskFailure) -> usize {
        self.drain_with(|future| {
            if future.set_running_or_notify_cancel() {
                let _ = future.set_failure(failure.clone());
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::future::FutureState;

    fn work(value: i64) -> (TaskFuture, Task) {
        let task = Task::function("square").args(&value).build().unwrap();
        (TaskFuture::new(task.id()), task)
    }

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new();
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let (future, task) = work(i);
                let id = task.id();
                queue.push_work(future, task);
                id
            })
            .collect();

        for id in ids {
            match queue.pop() {
                Some(Entry::Work(_, task)) => assert_eq!(task.id(), id),
                other => panic!("unexpected entry {other:?}"),
            }
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_sentinel_after_work() {
        let queue = WorkQueue::new();
        let (future, task) = work(1);
        queue.push_work(future, task);
        queue.push_shutdown();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending_count(), 1);
        assert!(matches!(queue.pop(), Some(Entry::Work(..))));
        assert!(!queue.has_work());
        assert!(matches!(queue.pop(), Some(Entry::Shutdown)));
    }

    #[test]
    fn test_cancel_keeps_sentinel() {
        let queue = WorkQueue::new();
        let mut futures = Vec::new();
        for i in 0..3 {
            let (future, task) = work(i);
            futures.push(future.clone());
            queue.push_work(future, task);
        }
        queue.push_shutdown();

        assert_eq!(queue.cancel(), 3);
        assert!(futures.iter().all(|f| f.state() == FutureState::Cancelled));
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.pop(), Some(Entry::Shutdown)));
    }

    #[test]
    fn test_cancel_reaches_work_behind_sentinel() {
        let queue = WorkQueue::new();
        let (ahead, task) = work(1);
        queue.push_work(ahead.clone(), task);
        queue.push_shutdown();
        let (behind, task) = work(2);
        queue.push_work(behind.clone(), task);

        assert_eq!(queue.cancel(), 2);
        assert!(ahead.is_cancelled());
        assert!(behind.is_cancelled());
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.pop(), Some(Entry::Shutdown)));
    }

    #[test]
    fn test_pop_where_keeps_rejected_in_place() {
        let queue = WorkQueue::new();
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let (future, task) = work(i);
                let id = task.id();
                queue.push_work(future, task);
                id
            })
            .collect();
        queue.push_shutdown();

        // The middle task goes first; the others keep their order.
        let middle = ids[1];
        match queue.pop_where(|_, task| task.id() == middle) {
            Some(Entry::Work(_, task)) => assert_eq!(task.id(), middle),
            other => panic!("unexpected entry {other:?}"),
        }
        assert!(queue.pop_where(|_, _| false).is_none());
        assert_eq!(queue.len(), 3);

        for id in [ids[0], ids[2]] {
            match queue.pop_where(|_, _| true) {
                Some(Entry::Work(_, task)) => assert_eq!(task.id(), id),
                other => panic!("unexpected entry {other:?}"),
            }
        }
        assert!(matches!(queue.pop_where(|_, _| false), Some(Entry::Shutdown)));
    }

    #[test]
    fn test_fail_resolves_futures() {
        let queue = WorkQueue::new();
        let (future, task) = work(1);
        queue.push_work(future.clone(), task);

        let failure = TaskFailure::new(FailureKind::Bootstrap, "no workers");
        assert_eq!(queue.fail(&failure), 1);
        assert_eq!(future.state(), FutureState::Failed);
        assert_eq!(future.failure().unwrap().kind, FailureKind::Bootstrap);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fail_skips_cancelled() {
        let queue = WorkQueue::new();
        let (future, task) = work(1);
        future.cancel();
        queue.push_work(future.clone(), task);
        queue.fail(&TaskFailure::transport("gone"));
        assert_eq!(future.state(), FutureState::Cancelled);
    }
}
