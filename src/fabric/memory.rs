//! In-process fabric.
//!
//! Workers are threads running the regular [`ServerWorker`] protocol. Every
//! message still travels as an encoded frame, so workers never share task
//! state with the producer and malformed frames behave as on a real wire.

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::executor::process::GroupLauncher;
use crate::fabric::{
    decode_frame, encode_frame, Communicator, Delivery, Fabric, Link, Mailbox, Message, ProcessGroup,
    Rank, Received, SendRequest,
};
use crate::pool::server::{ServerWorker, SetupScope};
use crate::task::registry::FunctionRegistry;
use crate::task::ExecutableTask;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Fabric whose workers are threads of the current process.
///
/// # Example
///
/// ```
/// use distpool::fabric::memory::ThreadFabric;
/// use distpool::fabric::Fabric;
///
/// let fabric = ThreadFabric::new(4).unwrap();
/// assert_eq!(fabric.spare_capacity(), Some(4));
/// ```
#[derive(Debug, Clone)]
pub struct ThreadFabric {
    slots: usize,
    launcher: GroupLauncher,
}

impl ThreadFabric {
    /// Creates a fabric offering `slots` workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the process-group runtime cannot be built.
    pub fn new(slots: usize) -> Result<Self> {
        Ok(Self {
            slots,
            launcher: GroupLauncher::new()?,
        })
    }
}

impl Fabric for ThreadFabric {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn spare_capacity(&self) -> Option<usize> {
        Some(self.slots)
    }

    fn spawn_workers(
        &self,
        count: usize,
        registry: &Arc<FunctionRegistry>,
        config: &PoolConfig,
    ) -> Result<Box<dyn Communicator>> {
        let mut peers = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for rank in 0..count {
            let (to_worker, worker_inbox) = unbounded();
            let (worker_outbox, from_worker) = unbounded();
            let link = ChannelLink {
                rank,
                inbox: worker_inbox,
                outbox: worker_outbox,
            };
            let worker = ServerWorker::new(link, Arc::clone(registry))
                .with_poll(config.poll)
                .with_clock(Arc::clone(&config.clock))
                .with_scope(SetupScope::Shared);

            let handle = std::thread::Builder::new()
                .name(format!("distpool-worker-{rank}"))
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        warn!("Worker {rank} stopped: {e}");
                    }
                })
                .map_err(|e| PoolError::Bootstrap {
                    reason: format!("Failed to start worker thread {rank}: {e}"),
                })?;

            peers.push(Peer {
                outbox: Some(to_worker),
                inbox: from_worker,
                mailbox: Mailbox::default(),
            });
            threads.push(handle);
        }

        info!("Started {count} in-process workers");
        Ok(Box::new(ChannelCommunicator {
            peers,
            threads,
            next_probe: 0,
        }))
    }

    fn launch_group(&self, task: &ExecutableTask) -> Result<Box<dyn ProcessGroup>> {
        Ok(Box::new(self.launcher.launch(task)?))
    }
}

struct Peer {
    outbox: Option<Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
    mailbox: Mailbox,
}

/// Producer side of a [`ThreadFabric`] group.
struct ChannelCommunicator {
    peers: Vec<Peer>,
    threads: Vec<JoinHandle<()>>,
    next_probe: usize,
}

impl ChannelCommunicator {
    fn peer(&mut self, rank: Rank) -> Result<&mut Peer> {
        self.peers.get_mut(rank).ok_or_else(|| PoolError::Transport {
            rank: Some(rank),
            reason: "no such worker".to_string(),
        })
    }
}

fn lost(rank: Rank) -> PoolError {
    PoolError::Transport {
        rank: Some(rank),
        reason: "worker thread is gone".to_string(),
    }
}

impl Communicator for ChannelCommunicator {
    fn remote_size(&self) -> usize {
        self.peers.len()
    }

    fn isend(&mut self, dest: Rank, message: &Message) -> Result<SendRequest> {
        let frame = encode_frame(message)?;
        let peer = self.peer(dest)?;
        let outbox = peer.outbox.as_ref().ok_or_else(|| lost(dest))?;
        outbox.send(frame).map_err(|_| lost(dest))?;
        Ok(SendRequest::delivered())
    }

    fn iprobe(&mut self) -> Result<Option<Rank>> {
        let count = self.peers.len();
        for offset in 0..count {
            let rank = (self.next_probe + offset) % count;
            let Peer { inbox, mailbox, .. } = &mut self.peers[rank];
            mailbox.fill(|| match inbox.try_recv() {
                Ok(frame) => Delivery::Frame(frame),
                Err(TryRecvError::Empty) => Delivery::Empty,
                Err(TryRecvError::Disconnected) => Delivery::Closed,
            });
            if mailbox.has_news() {
                self.next_probe = (rank + 1) % count;
                return Ok(Some(rank));
            }
        }
        Ok(None)
    }

    fn recv(&mut self, source: Rank) -> Result<Received> {
        let Peer { inbox, mailbox, .. } = self.peer(source)?;
        mailbox.take(|| inbox.recv().ok()).ok_or_else(|| lost(source))
    }

    fn disconnect(&mut self) -> Result<()> {
        for peer in &mut self.peers {
            peer.outbox = None;
        }
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!("Thread {name} panicked");
            }
        }
        debug!("Disconnected from {} in-process workers", self.peers.len());
        Ok(())
    }
}

impl Drop for ChannelCommunicator {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            let _ = self.disconnect();
        }
    }
}

/// Worker side of a [`ThreadFabric`] group.
struct ChannelLink {
    rank: Rank,
    inbox: Receiver<Vec<u8>>,
    outbox: Sender<Vec<u8>>,
}

impl Link for ChannelLink {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn try_recv(&mut self) -> Result<Option<Received>> {
        match self.inbox.try_recv() {
            Ok(frame) => Ok(Some(decode_frame(&frame))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PoolError::Transport {
                rank: Some(self.rank),
                reason: "producer is gone".to_string(),
            }),
        }
    }

    fn isend(&mut self, message: &Message) -> Result<SendRequest> {
        let frame = encode_frame(message)?;
        self.outbox.send(frame).map_err(|_| PoolError::Transport {
            rank: Some(self.rank),
            reason: "producer is gone".to_string(),
        })?;
        Ok(SendRequest::delivered())
    }

    fn disconnect(&mut self) -> Result<()> {
        debug!("Worker {} disconnecting", self.rank);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::fabric::{Handshake, Outcome};
    use crate::task::{decode, Task};
    use std::time::{Duration, Instant};

    fn registry() -> Arc<FunctionRegistry> {
        let mut registry = FunctionRegistry::new();
        registry.register("square", |x: i64| Ok::<_, String>(x * x));
        Arc::new(registry)
    }

    fn recv_blocking(comm: &mut dyn Communicator) -> (Rank, Received) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(rank) = comm.iprobe().unwrap() {
                return (rank, comm.recv(rank).unwrap());
            }
            assert!(Instant::now() < deadline, "nothing received");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn start(comm: &mut dyn Communicator) {
        for rank in 0..comm.remote_size() {
            comm.isend(rank, &Message::Setup(Handshake::default())).unwrap();
        }
        for _ in 0..comm.remote_size() {
            let (_, received) = recv_blocking(comm);
            assert_eq!(received, Received::Message(Message::Ready { initialized: true }));
        }
        for rank in 0..comm.remote_size() {
            comm.isend(rank, &Message::Proceed { start: true }).unwrap();
        }
    }

    #[test]
    fn test_workers_answer_tasks() {
        let fabric = ThreadFabric::new(2).unwrap();
        let mut comm = fabric.spawn_workers(2, &registry(), &PoolConfig::default()).unwrap();
        assert_eq!(comm.remote_size(), 2);
        start(comm.as_mut());

        let task = Task::function("square").args(&12i64).build().unwrap();
        comm.isend(1, &Message::Task(task)).unwrap();
        let (rank, received) = recv_blocking(comm.as_mut());
        assert_eq!(rank, 1);
        let Received::Message(Message::Outcome(Outcome::Value(bytes))) = received else {
            panic!("unexpected {received:?}");
        };
        assert_eq!(decode::<i64>(&bytes).unwrap(), 144);

        for rank in 0..2 {
            comm.isend(rank, &Message::Shutdown).unwrap();
        }
        comm.disconnect().unwrap();
    }

    #[test]
    fn test_unknown_function_fails_on_worker() {
        let fabric = ThreadFabric::new(1).unwrap();
        let mut comm = fabric.spawn_workers(1, &registry(), &PoolConfig::default()).unwrap();
        start(comm.as_mut());

        let unknown = Task::function("nope").build().unwrap();
        comm.isend(0, &Message::Task(unknown)).unwrap();
        let (_, received) = recv_blocking(comm.as_mut());
        let Received::Message(Message::Outcome(Outcome::Failure(failure))) = received else {
            panic!("unexpected {received:?}");
        };
        assert_eq!(failure.kind, FailureKind::Execution);

        comm.isend(0, &Message::Shutdown).unwrap();
        comm.disconnect().unwrap();
    }

    #[test]
    fn test_exited_worker_is_reported_lost() {
        let fabric = ThreadFabric::new(1).unwrap();
        let mut comm = fabric.spawn_workers(1, &registry(), &PoolConfig::default()).unwrap();

        // A worker told to stop during setup exits and drops its channel.
        comm.isend(0, &Message::Shutdown).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let rank = loop {
            if let Some(rank) = comm.iprobe().unwrap() {
                break rank;
            }
            assert!(Instant::now() < deadline, "loss not reported");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(rank, 0);
        assert!(matches!(comm.recv(0), Err(PoolError::Transport { rank: Some(0), .. })));
        assert_eq!(comm.iprobe().unwrap(), None);
        assert!(comm.isend(0, &Message::Shutdown).is_err());
        comm.disconnect().unwrap();
    }
}
