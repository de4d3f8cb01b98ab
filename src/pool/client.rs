//! Producer-side protocol engine.
//!
//! The [`ClientWorker`] owns the communicator to a worker group for the
//! lifetime of the pool. Each loop iteration dispatches at most one queued
//! task, collects finished results, reaps process groups and expires
//! overdue results; when nothing moved it backs off on the configured clock.
//!
//! Every rank is in exactly one place: the idle set, the pending map (keyed
//! by the rank holding the task), or excluded after a failure.

use crate::config::{Backoff, PoolConfig};
use crate::error::{FailureKind, PoolError, Result, TaskFailure};
use crate::fabric::{Communicator, Fabric, Handshake, Message, Outcome, ProcessGroup, Rank, Received, SendRequest};
use crate::future::TaskFuture;
use crate::pool::{ProtocolEngine, Role};
use crate::queue::{Entry, WorkQueue};
use crate::task::{encode, Task};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

enum Outstanding {
    /// Task sent to a worker; the worker answers with an outcome.
    Remote(SendRequest),
    /// Process group launched for an executable task.
    Group(Box<dyn ProcessGroup>),
}

struct Pending {
    future: TaskFuture,
    outstanding: Outstanding,
    ranks: Vec<Rank>,
    since: Instant,
}

/// Dispatches queued tasks to a group of workers and resolves their futures.
pub struct ClientWorker {
    comm: Box<dyn Communicator>,
    fabric: Option<Arc<dyn Fabric>>,
    queue: WorkQueue,
    config: PoolConfig,
    idle: BTreeSet<Rank>,
    pending: HashMap<Rank, Pending>,
    excluded: HashSet<Rank>,
    live: Arc<AtomicUsize>,
    draining: bool,
}

impl ClientWorker {
    /// Creates an engine for every rank of `comm`.
    ///
    /// `live` is kept at the number of usable workers.
    #[must_use]
    pub fn new(comm: Box<dyn Communicator>, queue: WorkQueue, config: PoolConfig, live: Arc<AtomicUsize>) -> Self {
        let size = comm.remote_size();
        live.store(size, Ordering::SeqCst);
        Self {
            comm,
            fabric: None,
            queue,
            config,
            idle: (0..size).collect(),
            pending: HashMap::new(),
            excluded: HashSet::new(),
            live,
            draining: false,
        }
    }

    /// Sets the fabric that launches process groups for executable tasks.
    #[must_use]
    pub fn with_fabric(mut self, fabric: Arc<dyn Fabric>) -> Self {
        self.fabric = Some(fabric);
        self
    }

    /// Number of workers still usable.
    #[must_use]
    pub fn total(&self) -> usize {
        self.comm.remote_size() - self.excluded.len()
    }

    /// Runs the startup handshake with every worker.
    ///
    /// Broadcasts `handshake`, collects each worker's initializer result and
    /// broadcasts their conjunction back. Workers only accept tasks when all
    /// of them initialized.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Bootstrap` if a worker failed to initialize, was
    /// lost, or did not answer within `timeout`.
    pub fn handshake(&mut self, handshake: &Handshake, timeout: Duration) -> Result<()> {
        let size = self.comm.remote_size();
        for rank in 0..size {
            self.comm.isend(rank, &Message::Setup(handshake.clone()))?;
        }

        let clock = Arc::clone(&self.config.clock);
        let deadline = clock.now() + timeout;
        let mut ready: HashMap<Rank, bool> = HashMap::new();
        let mut backoff = self.config.poll.backoff();
        while ready.len() < size {
            let Some(rank) = self.comm.iprobe()? else {
                if clock.now() >= deadline {
                    return Err(PoolError::Bootstrap {
                        reason: format!("{} of {size} workers answered within {timeout:?}", ready.len()),
                    });
                }
                backoff.wait(&*clock);
                continue;
            };
            match self.comm.recv(rank) {
                Ok(Received::Message(Message::Ready { initialized })) => {
                    ready.insert(rank, initialized);
                }
                Ok(other) => {
                    return Err(PoolError::Bootstrap {
                        reason: format!("Worker {rank} answered setup with {other:?}"),
                    })
                }
                Err(e) => {
                    return Err(PoolError::Bootstrap {
                        reason: format!("Worker {rank} lost during setup: {e}"),
                    })
                }
            }
        }

        let mut failed: Vec<Rank> = ready.iter().filter(|(_, ok)| !**ok).map(|(rank, _)| *rank).collect();
        failed.sort_unstable();
        let start = failed.is_empty();
        let requests: Vec<SendRequest> = (0..size)
            .map(|rank| self.comm.isend(rank, &Message::Proceed { start }))
            .collect::<Result<_>>()?;

        if start {
            info!("All {size} workers initialized");
            Ok(())
        } else {
            self.await_delivery(&requests);
            if let Err(e) = self.comm.disconnect() {
                warn!("Failed to disconnect after setup failure: {e}");
            }
            Err(PoolError::Bootstrap {
                reason: format!("Initializer failed on workers {failed:?}"),
            })
        }
    }

    /// Serves the queue until the shutdown sentinel arrives and every
    /// outstanding result is in, then stops the workers.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the fabric itself fails; outstanding
    /// futures fail with it first.
    pub fn run(&mut self) -> Result<()> {
        info!("ClientWorker serving {} workers", self.total());
        let mut backoff = self.config.poll.backoff();
        loop {
            let mut progressed = if self.draining { false } else { self.dispatch_next() };
            match self.collect() {
                Ok(collected) => progressed |= collected,
                Err(e) => {
                    error!("Fabric failed: {e}");
                    self.abandon(&TaskFailure::transport(e.to_string()));
                    return Err(e);
                }
            }
            progressed |= self.reap_groups();
            progressed |= self.expire_overdue();

            if self.draining && self.pending.is_empty() {
                break;
            }
            self.pause(&mut backoff, progressed);
        }
        self.stop_workers()
    }

    fn pause(&self, backoff: &mut Backoff, progressed: bool) {
        if progressed {
            backoff.reset();
        } else {
            backoff.wait(&*self.config.clock);
        }
    }

    /// Takes the oldest entry that can be acted on now. Returns true on progress.
    ///
    /// A task needing more idle workers than there are stays in line; later
    /// tasks that fit go first.
    fn dispatch_next(&mut self) -> bool {
        if self.idle.is_empty() && self.total() > 0 {
            return false;
        }
        let total = self.total();
        let idle = self.idle.len();
        let entry = self.queue.pop_where(|future, task| {
            let needed = task.num_workers();
            future.is_done() || total == 0 || needed <= idle || needed > total
        });
        let (future, task) = match entry {
            None => return false,
            Some(Entry::Shutdown) => return self.observe_shutdown(),
            Some(Entry::Work(future, task)) => (future, task),
        };
        if future.is_done() {
            debug!("Skipping cancelled task {}", task.id());
            return true;
        }

        if total == 0 {
            resolve(&future, Outcome::Failure(TaskFailure::transport("No workers left")));
            return true;
        }
        let needed = task.num_workers();
        if needed > total {
            warn!("Task {} needs {needed} workers; only {total} remain", task.id());
            resolve(&future, Outcome::Failure(TaskFailure::capacity(needed, total)));
            return true;
        }
        if !future.set_running_or_notify_cancel() {
            return true;
        }

        let ranks: Vec<Rank> = (0..needed).filter_map(|_| self.idle.pop_first()).collect();
        let primary = ranks[0];
        let since = self.config.clock.now();
        match task {
            Task::Function(call) => {
                let task_id = call.id();
                match self.comm.isend(primary, &Message::Task(Task::Function(call))) {
                    Ok(request) => {
                        debug!("Dispatched task {task_id} to worker {primary}");
                        self.pending.insert(
                            primary,
                            Pending {
                                future,
                                outstanding: Outstanding::Remote(request),
                                ranks,
                                since,
                            },
                        );
                    }
                    Err(e) => {
                        warn!("Failed to send task {task_id} to worker {primary}: {e}");
                        self.exclude(primary, &e.to_string());
                        resolve(&future, Outcome::Failure(TaskFailure::transport(e.to_string())));
                    }
                }
            }
            Task::Executable(exe) => {
                let launched = match &self.fabric {
                    Some(fabric) => fabric.launch_group(&exe),
                    None => Err(PoolError::Spawn {
                        program: exe.program().to_path_buf(),
                        reason: "no fabric to launch process groups".to_string(),
                    }),
                };
                match launched {
                    Ok(group) => {
                        debug!("Task {} running on workers {ranks:?}", exe.id());
                        self.pending.insert(
                            primary,
                            Pending {
                                future,
                                outstanding: Outstanding::Group(group),
                                ranks,
                                since,
                            },
                        );
                    }
                    Err(e) => {
                        warn!("Failed to launch task {}: {e}", exe.id());
                        self.idle.extend(ranks);
                        resolve(&future, Outcome::Failure(TaskFailure::new(FailureKind::Spawn, e.to_string())));
                    }
                }
            }
        }
        true
    }

    fn observe_shutdown(&mut self) -> bool {
        info!("Shutdown requested; waiting for {} outstanding results", self.pending.len());
        self.draining = true;
        true
    }

    /// Receives every result that is ready.
    fn collect(&mut self) -> Result<bool> {
        let mut progressed = false;
        for _ in 0..self.comm.remote_size() {
            let Some(rank) = self.comm.iprobe()? else {
                break;
            };
            progressed = true;
            match self.comm.recv(rank) {
                Ok(Received::Message(Message::Outcome(outcome))) => self.complete(rank, outcome),
                Ok(Received::Undecodable(reason)) => {
                    self.complete(rank, Outcome::Failure(TaskFailure::new(FailureKind::Decode, reason)));
                }
                Ok(Received::Message(other)) => warn!("Ignoring unexpected {other:?} from worker {rank}"),
                Err(e) => self.exclude(rank, &e.to_string()),
            }
        }
        Ok(progressed)
    }

    fn complete(&mut self, rank: Rank, outcome: Outcome) {
        let Some(entry) = self.pending.remove(&rank) else {
            warn!("Worker {rank} answered without an outstanding task");
            return;
        };
        debug!("Worker {rank} finished task {}", entry.future.id());
        self.release(&entry.ranks);
        resolve(&entry.future, outcome);
    }

    fn release(&mut self, ranks: &[Rank]) {
        self.idle.extend(ranks.iter().filter(|rank| !self.excluded.contains(*rank)));
    }

    fn reap_groups(&mut self) -> bool {
        let finished: Vec<(Rank, Outcome)> = self
            .pending
            .iter_mut()
            .filter_map(|(rank, entry)| match &mut entry.outstanding {
                Outstanding::Group(group) => group.try_wait().map(|outcome| (*rank, group_outcome(outcome))),
                Outstanding::Remote(_) => None,
            })
            .collect();
        let progressed = !finished.is_empty();
        for (rank, outcome) in finished {
            self.complete(rank, outcome);
        }
        progressed
    }

    /// Gives up on results older than the configured timeout.
    fn expire_overdue(&mut self) -> bool {
        let Some(limit) = self.config.result_timeout else {
            return false;
        };
        let now = self.config.clock.now();
        let overdue: Vec<Rank> = self
            .pending
            .iter()
            .filter(|(_, entry)| matches!(entry.outstanding, Outstanding::Remote(_)))
            .filter(|(_, entry)| now.duration_since(entry.since) >= limit)
            .map(|(rank, _)| *rank)
            .collect();
        for rank in &overdue {
            self.exclude(*rank, &format!("no result within {limit:?}"));
        }
        !overdue.is_empty()
    }

    /// Stops dispatching to `rank` and fails whatever it held.
    fn exclude(&mut self, rank: Rank, reason: &str) {
        if !self.excluded.insert(rank) {
            return;
        }
        self.idle.remove(&rank);
        let total = self.total();
        self.live.store(total, Ordering::SeqCst);
        warn!("Excluding worker {rank}: {reason}; {total} workers left");

        if let Some(mut entry) = self.pending.remove(&rank) {
            if let Outstanding::Group(group) = &mut entry.outstanding {
                group.kill();
            }
            self.release(&entry.ranks);
            resolve(
                &entry.future,
                Outcome::Failure(TaskFailure::transport(format!("Worker {rank}: {reason}"))),
            );
        }
    }

    /// Fails everything outstanding and everything queued.
    fn abandon(&mut self, failure: &TaskFailure) {
        for (_, mut entry) in self.pending.drain() {
            if let Outstanding::Group(group) = &mut entry.outstanding {
                group.kill();
            }
            resolve(&entry.future, Outcome::Failure(failure.clone()));
        }
        self.queue.fail(failure);
    }

    fn await_delivery(&self, requests: &[SendRequest]) {
        let clock = &*self.config.clock;
        let grace = self.config.shutdown_grace;
        let deadline = clock.now() + grace;
        let mut backoff = self.config.poll.backoff();
        while requests.iter().any(|request| matches!(request.test(), Ok(false))) {
            if clock.now() >= deadline {
                warn!("Gave up waiting for delivery after {grace:?}");
                return;
            }
            backoff.wait(clock);
        }
    }

    fn stop_workers(&mut self) -> Result<()> {
        let live: Vec<Rank> = self.idle.iter().copied().collect();
        info!("Stopping {} workers", live.len());
        let requests: Vec<SendRequest> = live
            .iter()
            .filter_map(|rank| match self.comm.isend(*rank, &Message::Shutdown) {
                Ok(request) => Some(request),
                Err(e) => {
                    warn!("Failed to stop worker {rank}: {e}");
                    None
                }
            })
            .collect();
        self.await_delivery(&requests);
        self.comm.disconnect()
    }
}

impl ProtocolEngine for ClientWorker {
    fn role(&self) -> Role {
        Role::Producer
    }

    fn run(mut self: Box<Self>) -> Result<()> {
        ClientWorker::run(&mut self)
    }
}

fn group_outcome(outcome: crate::fabric::GroupOutcome) -> Outcome {
    match outcome {
        Ok(results) => match encode(&results) {
            Ok(bytes) => Outcome::Value(bytes),
            Err(e) => Outcome::Failure(TaskFailure::execution(e.to_string())),
        },
        Err(failure) => Outcome::Failure(failure),
    }
}

fn resolve(future: &TaskFuture, outcome: Outcome) {
    let resolved = match outcome {
        Outcome::Value(value) => future.set_result(value),
        Outcome::Failure(failure) => future.set_failure(failure),
    };
    if let Err(e) = resolved {
        debug!("Task {} already resolved: {e}", future.id());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{Clock, ManualClock, PollPolicy};
    use crate::future::FutureState;
    use crate::task::registry::FunctionRegistry;
    use crate::task::{decode, ExecutableTask, ExecutionResult, TaskId};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    enum Reply {
        Message(Message),
        Lost,
    }

    /// Communicator answering from a registry, with scriptable faults.
    #[derive(Default)]
    struct Script {
        size: usize,
        inbox: VecDeque<(Rank, Reply)>,
        sent: Vec<(Rank, Message)>,
        silent: HashSet<Rank>,
        dead: HashSet<Rank>,
        refuse_init: HashSet<Rank>,
        /// Replies from these ranks stay hidden for the given number of probes.
        held: HashMap<Rank, usize>,
        /// Stop signals are never delivered.
        stuck_shutdown: bool,
        disconnected: bool,
    }

    #[derive(Clone)]
    struct FakeComm {
        script: Arc<Mutex<Script>>,
        registry: Arc<FunctionRegistry>,
    }

    impl FakeComm {
        fn new(size: usize) -> Self {
            let mut registry = FunctionRegistry::new();
            registry
                .register("square", |x: i64| Ok::<_, String>(x * x))
                .register("boom", |_: ()| Err::<(), _>("boom"));
            Self {
                script: Arc::new(Mutex::new(Script {
                    size,
                    ..Script::default()
                })),
                registry: Arc::new(registry),
            }
        }

        fn sent_to(&self, rank: Rank) -> Vec<Message> {
            let script = self.script.lock();
            script.sent.iter().filter(|(r, _)| *r == rank).map(|(_, m)| m.clone()).collect()
        }

        fn tasks_sent(&self) -> usize {
            let script = self.script.lock();
            script.sent.iter().filter(|(_, m)| matches!(m, Message::Task(_))).count()
        }
    }

    impl Communicator for FakeComm {
        fn remote_size(&self) -> usize {
            self.script.lock().size
        }

        fn isend(&mut self, dest: Rank, message: &Message) -> Result<SendRequest> {
            let mut script = self.script.lock();
            script.sent.push((dest, message.clone()));
            if script.dead.contains(&dest) {
                script.inbox.push_back((dest, Reply::Lost));
                return Ok(SendRequest::delivered());
            }
            match message {
                Message::Setup(_) => {
                    let initialized = !script.refuse_init.contains(&dest);
                    script.inbox.push_back((dest, Reply::Message(Message::Ready { initialized })));
                }
                Message::Shutdown if script.stuck_shutdown => return Ok(SendRequest::new()),
                Message::Task(Task::Function(call)) if !script.silent.contains(&dest) => {
                    let outcome = Outcome::from(self.registry.call(call));
                    script.inbox.push_back((dest, Reply::Message(Message::Outcome(outcome))));
                }
                _ => {}
            }
            Ok(SendRequest::delivered())
        }

        fn iprobe(&mut self) -> Result<Option<Rank>> {
            let mut guard = self.script.lock();
            let script = &mut *guard;
            script.held.retain(|_, probes| {
                *probes = probes.saturating_sub(1);
                *probes > 0
            });
            Ok(script
                .inbox
                .iter()
                .map(|(rank, _)| *rank)
                .find(|rank| !script.held.contains_key(rank)))
        }

        fn recv(&mut self, source: Rank) -> Result<Received> {
            let mut script = self.script.lock();
            let index = script.inbox.iter().position(|(rank, _)| *rank == source).unwrap();
            match script.inbox.remove(index).unwrap().1 {
                Reply::Message(message) => Ok(Received::Message(message)),
                Reply::Lost => Err(PoolError::Transport {
                    rank: Some(source),
                    reason: "connection reset".to_string(),
                }),
            }
        }

        fn disconnect(&mut self) -> Result<()> {
            self.script.lock().disconnected = true;
            Ok(())
        }
    }

    /// Fabric whose process groups finish immediately.
    #[derive(Default)]
    struct FakeFabric {
        fail: bool,
        launched: Mutex<Vec<TaskId>>,
    }

    struct FinishedGroup(Option<ExecutableTask>);

    impl ProcessGroup for FinishedGroup {
        fn try_wait(&mut self) -> Option<crate::fabric::GroupOutcome> {
            let task = self.0.take()?;
            Some(Ok((0..task.num_workers())
                .map(|rank| ExecutionResult::new(task.id(), rank, 0, Vec::new(), Vec::new(), Duration::ZERO))
                .collect()))
        }

        fn kill(&mut self) {}
    }

    impl Fabric for FakeFabric {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn spare_capacity(&self) -> Option<usize> {
            None
        }

        fn spawn_workers(
            &self,
            _count: usize,
            _registry: &Arc<FunctionRegistry>,
            _config: &PoolConfig,
        ) -> Result<Box<dyn Communicator>> {
            unreachable!()
        }

        fn launch_group(&self, task: &ExecutableTask) -> Result<Box<dyn ProcessGroup>> {
            self.launched.lock().push(task.id());
            if self.fail {
                return Err(PoolError::Spawn {
                    program: task.program().to_path_buf(),
                    reason: "no such file".to_string(),
                });
            }
            Ok(Box::new(FinishedGroup(Some(task.clone()))))
        }
    }

    fn config() -> PoolConfig {
        PoolConfig {
            poll: PollPolicy::fixed(Duration::from_millis(1)),
            clock: Arc::new(ManualClock::new()),
            ..PoolConfig::default()
        }
    }

    fn engine(comm: &FakeComm, queue: &WorkQueue, config: PoolConfig) -> (ClientWorker, Arc<AtomicUsize>) {
        let live = Arc::new(AtomicUsize::new(0));
        let engine = ClientWorker::new(Box::new(comm.clone()), queue.clone(), config, Arc::clone(&live));
        (engine, live)
    }

    fn submit(queue: &WorkQueue, task: Task) -> TaskFuture {
        let future = TaskFuture::new(task.id());
        queue.push_work(future.clone(), task);
        future
    }

    fn square(x: i64) -> Task {
        Task::function("square").args(&x).build().unwrap()
    }

    fn executable(workers: usize) -> Task {
        Task::executable("/bin/true").num_workers(workers).build().unwrap()
    }

    #[test]
    fn test_handshake_reduces_initializer_results() {
        let comm = FakeComm::new(3);
        let (mut engine, _) = engine(&comm, &WorkQueue::new(), config());
        engine.handshake(&Handshake::default(), Duration::from_secs(1)).unwrap();
        for rank in 0..3 {
            assert_eq!(comm.sent_to(rank).last(), Some(&Message::Proceed { start: true }));
        }
    }

    #[test]
    fn test_handshake_fails_when_one_initializer_fails() {
        let comm = FakeComm::new(3);
        comm.script.lock().refuse_init.insert(1);
        let (mut engine, _) = engine(&comm, &WorkQueue::new(), config());

        let result = engine.handshake(&Handshake::default(), Duration::from_secs(1));
        assert!(matches!(result, Err(PoolError::Bootstrap { ref reason }) if reason.contains("[1]")));
        for rank in 0..3 {
            assert_eq!(comm.sent_to(rank).last(), Some(&Message::Proceed { start: false }));
        }
        assert!(comm.script.lock().disconnected);
    }

    #[test]
    fn test_handshake_fails_on_lost_worker() {
        let comm = FakeComm::new(2);
        comm.script.lock().dead.insert(1);
        let (mut engine, _) = engine(&comm, &WorkQueue::new(), config());

        let result = engine.handshake(&Handshake::default(), Duration::from_millis(50));
        assert!(matches!(result, Err(PoolError::Bootstrap { .. })));
    }

    #[test]
    fn test_runs_queue_to_completion() {
        let comm = FakeComm::new(2);
        let queue = WorkQueue::new();
        let futures: Vec<TaskFuture> = (1..=5).map(|x| submit(&queue, square(x))).collect();
        let failing = submit(&queue, Task::function("boom").build().unwrap());
        queue.push_shutdown();

        let (mut engine, live) = engine(&comm, &queue, config());
        engine.run().unwrap();

        let values: Vec<i64> = futures.iter().map(|f| f.result::<i64>(None).unwrap()).collect();
        assert_eq!(values, vec![1, 4, 9, 16, 25]);
        assert_eq!(failing.failure().unwrap().message, "boom");
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(comm.sent_to(0).last(), Some(&Message::Shutdown));
        assert_eq!(comm.sent_to(1).last(), Some(&Message::Shutdown));
        assert!(comm.script.lock().disconnected);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_lost_worker_is_excluded() {
        let comm = FakeComm::new(2);
        comm.script.lock().dead.insert(0);
        let queue = WorkQueue::new();
        let first = submit(&queue, square(2));
        let rest: Vec<TaskFuture> = (3..6).map(|x| submit(&queue, square(x))).collect();
        queue.push_shutdown();

        let (mut engine, live) = engine(&comm, &queue, config());
        engine.run().unwrap();

        let failure = first.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Transport);
        for future in &rest {
            assert_eq!(future.state(), FutureState::Fulfilled);
        }
        assert_eq!(live.load(Ordering::SeqCst), 1);
        // Only the surviving worker is told to stop.
        assert!(!comm.sent_to(0).contains(&Message::Shutdown));
        assert_eq!(comm.sent_to(1).last(), Some(&Message::Shutdown));
    }

    #[test]
    fn test_all_workers_lost_fails_queue() {
        let comm = FakeComm::new(1);
        comm.script.lock().dead.insert(0);
        let queue = WorkQueue::new();
        let futures: Vec<TaskFuture> = (0..3).map(|x| submit(&queue, square(x))).collect();
        queue.push_shutdown();

        let (mut engine, live) = engine(&comm, &queue, config());
        engine.run().unwrap();

        for future in &futures {
            assert_eq!(future.failure().unwrap().kind, FailureKind::Transport);
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_overdue_result_fails_with_transport() {
        let comm = FakeComm::new(2);
        comm.script.lock().silent.insert(0);
        let queue = WorkQueue::new();
        let stuck = submit(&queue, square(2));
        let fine = submit(&queue, square(3));
        queue.push_shutdown();

        let config = PoolConfig {
            result_timeout: Some(Duration::from_millis(50)),
            ..config()
        };
        let (mut engine, live) = engine(&comm, &queue, config);
        engine.run().unwrap();

        assert_eq!(stuck.failure().unwrap().kind, FailureKind::Transport);
        assert_eq!(fine.result::<i64>(None).unwrap(), 9);
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_task_is_never_sent() {
        let comm = FakeComm::new(1);
        let queue = WorkQueue::new();
        let cancelled = submit(&queue, square(2));
        assert!(cancelled.cancel());
        let kept = submit(&queue, square(4));
        queue.push_shutdown();

        let (mut engine, _) = engine(&comm, &queue, config());
        engine.run().unwrap();

        assert!(cancelled.is_cancelled());
        assert_eq!(kept.result::<i64>(None).unwrap(), 16);
        assert_eq!(comm.tasks_sent(), 1);
    }

    #[test]
    fn test_executable_occupies_its_workers() {
        let comm = FakeComm::new(3);
        let queue = WorkQueue::new();
        let group = submit(&queue, executable(3));
        let after = submit(&queue, square(5));
        queue.push_shutdown();

        let (engine, _) = engine(&comm, &queue, config());
        let mut engine = engine.with_fabric(Arc::new(FakeFabric::default()));
        engine.run().unwrap();

        let results: Vec<ExecutionResult> = decode(&group.raw_result(None).unwrap()).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(after.result::<i64>(None).unwrap(), 25);
        // Group members are launched by the fabric, not sent to workers.
        assert_eq!(comm.tasks_sent(), 1);
    }

    #[test]
    fn test_spawn_failure_releases_workers() {
        let comm = FakeComm::new(2);
        let queue = WorkQueue::new();
        let group = submit(&queue, executable(2));
        let after: Vec<TaskFuture> = (0..2).map(|x| submit(&queue, square(x))).collect();
        queue.push_shutdown();

        let (engine, live) = engine(&comm, &queue, config());
        let mut engine = engine.with_fabric(Arc::new(FakeFabric { fail: true, ..FakeFabric::default() }));
        engine.run().unwrap();

        assert_eq!(group.failure().unwrap().kind, FailureKind::Spawn);
        assert!(after.iter().all(|f| f.state() == FutureState::Fulfilled));
        assert_eq!(live.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_oversized_task_fails_with_capacity() {
        let comm = FakeComm::new(2);
        let queue = WorkQueue::new();
        let group = submit(&queue, executable(3));
        queue.push_shutdown();

        let (mut engine, _) = engine(&comm, &queue, config());
        engine.run().unwrap();

        let err = group.raw_result(None).unwrap_err();
        assert!(matches!(err, PoolError::Capacity { requested: 3, available: 2 }));
    }

    #[test]
    fn test_busy_workers_defer_large_task() {
        let comm = FakeComm::new(2);
        comm.script.lock().silent.insert(0);
        let queue = WorkQueue::new();
        // Worker 0 never answers; once it is excluded the pair no longer fits.
        let blocker = submit(&queue, square(1));
        let pair = submit(&queue, executable(2));
        let small = submit(&queue, square(3));
        queue.push_shutdown();

        let config = PoolConfig {
            result_timeout: Some(Duration::from_millis(100)),
            ..config()
        };
        let (engine, _) = engine(&comm, &queue, config);
        let mut engine = engine.with_fabric(Arc::new(FakeFabric::default()));
        engine.run().unwrap();

        assert_eq!(small.result::<i64>(None).unwrap(), 9);
        assert_eq!(blocker.failure().unwrap().kind, FailureKind::Transport);
        assert!(matches!(pair.raw_result(None), Err(PoolError::Capacity { requested: 2, available: 1 })));
    }

    #[test]
    fn test_deferred_tasks_launch_in_submission_order() {
        let comm = FakeComm::new(2);
        // The first task holds worker 0 for a few polls.
        comm.script.lock().held.insert(0, 4);
        let queue = WorkQueue::new();
        let holder = submit(&queue, square(2));
        let first = submit(&queue, executable(2));
        let second = submit(&queue, executable(2));
        queue.push_shutdown();

        let fabric = Arc::new(FakeFabric::default());
        let (engine, _) = engine(&comm, &queue, config());
        let mut engine = engine.with_fabric(Arc::clone(&fabric) as Arc<dyn Fabric>);
        engine.run().unwrap();

        assert_eq!(holder.result::<i64>(None).unwrap(), 4);
        assert_eq!(*fabric.launched.lock(), vec![first.id(), second.id()]);
        assert_eq!(first.state(), FutureState::Fulfilled);
        assert_eq!(second.state(), FutureState::Fulfilled);
    }

    #[test]
    fn test_undelivered_stop_waits_grace_on_pool_clock() {
        let comm = FakeComm::new(2);
        comm.script.lock().stuck_shutdown = true;
        let queue = WorkQueue::new();
        queue.push_shutdown();

        let clock = Arc::new(ManualClock::new());
        let start = clock.now();
        let config = PoolConfig {
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            shutdown_grace: Duration::from_secs(60),
            ..config()
        };
        let (mut engine, _) = engine(&comm, &queue, config);
        engine.run().unwrap();

        // Only the manual clock moved; the test itself does not wait a minute.
        assert!(clock.now() - start >= Duration::from_secs(60));
        assert!(comm.script.lock().disconnected);
    }
}
