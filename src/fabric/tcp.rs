//! Worker processes over loopback TCP.
//!
//! The producer listens on an ephemeral loopback port and starts the worker
//! program `n` times. Each child finds the address, its rank and the group
//! size in its environment, connects back and greets with
//! [`Message::Hello`]. Frames are a little-endian `u32` length followed by
//! the bincode body.
//!
//! A reader task per connection feeds received frames into a channel and a
//! writer task drains outgoing frames, completing each [`SendRequest`] once
//! its bytes are flushed.

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::executor::process::GroupLauncher;
use crate::fabric::{
    decode_frame, encode_frame, program_name, Communicator, Delivery, Fabric, Link, Mailbox, Message,
    ProcessGroup, Rank, Received, SendRequest, MAX_FRAME_LEN,
};
use crate::task::registry::FunctionRegistry;
use crate::task::ExecutableTask;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Address of the producer, set for spawned workers.
pub const PARENT_ADDR_ENV: &str = "DISTPOOL_PARENT_ADDR";

/// Rank of a spawned worker.
pub const WORKER_RANK_ENV: &str = "DISTPOOL_WORKER_RANK";

/// Size of the spawned worker group.
pub const WORKER_COUNT_ENV: &str = "DISTPOOL_WORKER_COUNT";

/// Overrides the number of process slots on this host.
pub const UNIVERSE_SIZE_ENV: &str = "DISTPOOL_UNIVERSE_SIZE";

/// How long workers get to exit after disconnecting.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

type Outgoing = (Vec<u8>, SendRequest);

/// Writes one frame.
async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(frame.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("Frame too large: {} bytes", frame.len()))
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Reads one frame; `None` on a clean end of stream.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {len} bytes"),
        ));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(buffer))
}

async fn read_loop(mut reader: OwnedReadHalf, inbox: UnboundedSender<Vec<u8>>, peer: String) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if inbox.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("{peer} closed the connection");
                break;
            }
            Err(e) => {
                warn!("Failed to read from {peer}: {e}");
                break;
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbox: UnboundedReceiver<Outgoing>, peer: String) {
    while let Some((frame, request)) = outbox.recv().await {
        match write_frame(&mut writer, &frame).await {
            Ok(()) => request.complete(),
            Err(e) => {
                error!("Failed to write to {peer}: {e}");
                request.fail();
                break;
            }
        }
    }
    // Remaining requests fail when their senders see the closed channel.
    outbox.close();
    while let Ok((_, request)) = outbox.try_recv() {
        request.fail();
    }
    let _ = writer.shutdown().await;
}

/// Both directions of one connection, driven by tasks on `runtime`.
struct Wire {
    outbox: Option<UnboundedSender<Outgoing>>,
    inbox: UnboundedReceiver<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Wire {
    fn start(runtime: &Runtime, stream: TcpStream, peer: &str) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (inbox_tx, inbox) = unbounded_channel();
        let (outbox, outbox_rx) = unbounded_channel();
        let reader = runtime.spawn(read_loop(read_half, inbox_tx, peer.to_string()));
        let writer = runtime.spawn(write_loop(write_half, outbox_rx, peer.to_string()));
        Self {
            outbox: Some(outbox),
            inbox,
            reader,
            writer,
        }
    }

    fn send(&self, message: &Message) -> Result<SendRequest> {
        let frame = encode_frame(message)?;
        let request = SendRequest::new();
        let outbox = self.outbox.as_ref().ok_or_else(|| closed("connection closed"))?;
        outbox
            .send((frame, request.clone()))
            .map_err(|_| closed("connection closed"))?;
        Ok(request)
    }

    /// Stops sending and waits for queued frames to flush.
    fn close(&mut self, runtime: &Runtime) {
        self.outbox = None;
        let writer = &mut self.writer;
        if runtime.block_on(tokio::time::timeout(REAP_TIMEOUT, writer)).is_err() {
            self.writer.abort();
        }
        self.reader.abort();
    }
}

fn closed(reason: &str) -> PoolError {
    PoolError::Transport {
        rank: None,
        reason: reason.to_string(),
    }
}

fn bootstrap(reason: impl Into<String>) -> PoolError {
    PoolError::Bootstrap { reason: reason.into() }
}

/// Fabric that runs each worker as a child process.
///
/// The worker program must call
/// [`run_worker_if_spawned`](crate::pool::run_worker_if_spawned) first thing
/// in `main`.
///
/// # Example
///
/// ```no_run
/// use distpool::fabric::tcp::ProcessFabric;
/// use distpool::fabric::Fabric;
///
/// let fabric = ProcessFabric::new().unwrap().with_universe_size(8);
/// assert_eq!(fabric.spare_capacity(), Some(7));
/// ```
pub struct ProcessFabric {
    program: PathBuf,
    args: Vec<String>,
    universe: usize,
    runtime: Arc<Runtime>,
    launcher: GroupLauncher,
}

impl ProcessFabric {
    /// Creates a fabric that re-launches the current executable.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be determined or
    /// the runtime cannot be built.
    pub fn new() -> Result<Self> {
        let program = std::env::current_exe()?;
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("distpool-net")
                .enable_all()
                .build()?,
        );
        let universe = universe_from_env().unwrap_or_else(num_cpus::get);
        info!("ProcessFabric initialized with {universe} slots");
        Ok(Self {
            program,
            args: Vec::new(),
            universe,
            launcher: GroupLauncher::from_runtime(Arc::clone(&runtime)),
            runtime,
        })
    }

    /// Sets the worker program.
    #[must_use]
    pub fn with_program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.program = program.into();
        self
    }

    /// Sets extra arguments passed to every worker.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Sets the number of process slots, the producer's included.
    #[must_use]
    pub const fn with_universe_size(mut self, universe: usize) -> Self {
        self.universe = universe;
        self
    }

    /// Returns the worker program.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn start_children(&self, addr: SocketAddr, count: usize) -> Result<Vec<Child>> {
        let _guard = self.runtime.enter();
        let mut children = Vec::with_capacity(count);
        for rank in 0..count {
            let child = Command::new(&self.program)
                .args(&self.args)
                .env(PARENT_ADDR_ENV, addr.to_string())
                .env(WORKER_RANK_ENV, rank.to_string())
                .env(WORKER_COUNT_ENV, count.to_string())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    error!("Failed to spawn worker {rank} ({}): {e}", self.program.display());
                    bootstrap(format!("Failed to spawn {}: {e}", self.program.display()))
                })?;
            children.push(child);
        }
        Ok(children)
    }
}

impl std::fmt::Debug for ProcessFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessFabric")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("universe", &self.universe)
            .finish_non_exhaustive()
    }
}

fn universe_from_env() -> Option<usize> {
    let raw = std::env::var(UNIVERSE_SIZE_ENV).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => {
            warn!("Ignoring {UNIVERSE_SIZE_ENV}={raw}: expected a positive integer");
            None
        }
        Ok(n) => Some(n),
    }
}

/// Accepts one connection per rank, each opened with a `Hello`.
async fn accept_workers(listener: &TcpListener, count: usize) -> Result<Vec<(TcpStream, String)>> {
    let mut streams: Vec<Option<(TcpStream, String)>> = (0..count).map(|_| None).collect();
    for _ in 0..count {
        let (mut stream, peer) = listener.accept().await?;
        let greeting = read_frame(&mut stream)
            .await?
            .map(|frame| decode_frame(&frame));
        match greeting {
            Some(Received::Message(Message::Hello { rank })) if rank < count => {
                debug!("Worker {rank} connected from {peer}");
                if streams[rank].replace((stream, format!("worker {rank}"))).is_some() {
                    return Err(bootstrap(format!("Worker {rank} connected twice")));
                }
            }
            other => return Err(bootstrap(format!("Unexpected greeting from {peer}: {other:?}"))),
        }
    }
    streams
        .into_iter()
        .enumerate()
        .map(|(rank, stream)| stream.ok_or_else(|| bootstrap(format!("Worker {rank} never connected"))))
        .collect()
}

impl Fabric for ProcessFabric {
    fn name(&self) -> &'static str {
        "processes"
    }

    fn spare_capacity(&self) -> Option<usize> {
        Some(self.universe.saturating_sub(1).max(1))
    }

    fn worker_program(&self) -> Option<String> {
        program_name(&self.program)
    }

    fn spawn_workers(
        &self,
        count: usize,
        _registry: &Arc<FunctionRegistry>,
        config: &PoolConfig,
    ) -> Result<Box<dyn Communicator>> {
        let listener = self
            .runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .map_err(|e| bootstrap(format!("Failed to listen: {e}")))?;
        let addr = listener.local_addr()?;
        info!("Spawning {count} workers of {} reporting to {addr}", self.program.display());

        let children = self.start_children(addr, count)?;
        let streams = self
            .runtime
            .block_on(tokio::time::timeout(config.bootstrap_timeout, accept_workers(&listener, count)))
            .map_err(|_| {
                bootstrap(format!(
                    "Workers did not connect within {:?}",
                    config.bootstrap_timeout
                ))
            })??;

        let wires = streams
            .into_iter()
            .map(|(stream, peer)| (Wire::start(&self.runtime, stream, &peer), Mailbox::default()))
            .collect();

        Ok(Box::new(TcpCommunicator {
            runtime: Arc::clone(&self.runtime),
            wires,
            children,
            next_probe: 0,
        }))
    }

    fn launch_group(&self, task: &ExecutableTask) -> Result<Box<dyn ProcessGroup>> {
        Ok(Box::new(self.launcher.launch(task)?))
    }
}

/// Producer side of a [`ProcessFabric`] group.
struct TcpCommunicator {
    runtime: Arc<Runtime>,
    wires: Vec<(Wire, Mailbox)>,
    children: Vec<Child>,
    next_probe: usize,
}

fn lost(rank: Rank) -> PoolError {
    PoolError::Transport {
        rank: Some(rank),
        reason: "connection to worker lost".to_string(),
    }
}

impl TcpCommunicator {
    fn wire(&mut self, rank: Rank) -> Result<&mut (Wire, Mailbox)> {
        self.wires.get_mut(rank).ok_or_else(|| PoolError::Transport {
            rank: Some(rank),
            reason: "no such worker".to_string(),
        })
    }
}

impl Communicator for TcpCommunicator {
    fn remote_size(&self) -> usize {
        self.wires.len()
    }

    fn isend(&mut self, dest: Rank, message: &Message) -> Result<SendRequest> {
        let (wire, _) = self.wire(dest)?;
        wire.send(message).map_err(|_| lost(dest))
    }

    fn iprobe(&mut self) -> Result<Option<Rank>> {
        let count = self.wires.len();
        for offset in 0..count {
            let rank = (self.next_probe + offset) % count;
            let (wire, mailbox) = &mut self.wires[rank];
            mailbox.fill(|| match wire.inbox.try_recv() {
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
        let (wire, mailbox) = self.wire(source)?;
        mailbox.take(|| wire.inbox.blocking_recv()).ok_or_else(|| lost(source))
    }

    fn disconnect(&mut self) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        for (wire, _) in &mut self.wires {
            wire.close(&runtime);
        }
        for (rank, mut child) in self.children.drain(..).enumerate() {
            match runtime.block_on(tokio::time::timeout(REAP_TIMEOUT, child.wait())) {
                Ok(Ok(status)) => debug!("Worker {rank} exited with {status}"),
                Ok(Err(e)) => warn!("Failed to reap worker {rank}: {e}"),
                Err(_) => {
                    warn!("Worker {rank} did not exit within {REAP_TIMEOUT:?}; killing it");
                    let _ = runtime.block_on(child.kill());
                }
            }
        }
        info!("Disconnected from {} worker processes", self.wires.len());
        Ok(())
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        for (wire, _) in &self.wires {
            wire.reader.abort();
            wire.writer.abort();
        }
    }
}

/// Worker side of a [`ProcessFabric`] group.
pub struct TcpLink {
    rank: Rank,
    runtime: Runtime,
    wire: Wire,
}

impl TcpLink {
    /// Connects to the producer at `addr` as worker `rank`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the producer cannot be reached.
    pub fn connect(addr: &str, rank: Rank) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("distpool-link")
            .enable_all()
            .build()?;

        let hello = encode_frame(&Message::Hello { rank })?;
        let stream = runtime
            .block_on(async {
                let mut stream = TcpStream::connect(addr).await?;
                write_frame(&mut stream, &hello).await?;
                Ok::<_, std::io::Error>(stream)
            })
            .map_err(|e| PoolError::Transport {
                rank: Some(rank),
                reason: format!("Failed to connect to {addr}: {e}"),
            })?;
        info!("Worker {rank} connected to {addr}");

        let wire = Wire::start(&runtime, stream, "producer");
        Ok(Self { rank, runtime, wire })
    }
}

impl std::fmt::Debug for TcpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpLink").field("rank", &self.rank).finish_non_exhaustive()
    }
}

impl Link for TcpLink {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn try_recv(&mut self) -> Result<Option<Received>> {
        match self.wire.inbox.try_recv() {
            Ok(frame) => Ok(Some(decode_frame(&frame))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PoolError::Transport {
                rank: Some(self.rank),
                reason: "producer closed the connection".to_string(),
            }),
        }
    }

    fn isend(&mut self, message: &Message) -> Result<SendRequest> {
        self.wire.send(message).map_err(|_| PoolError::Transport {
            rank: Some(self.rank),
            reason: "producer closed the connection".to_string(),
        })
    }

    fn disconnect(&mut self) -> Result<()> {
        self.wire.close(&self.runtime);
        debug!("Worker {} disconnected", self.rank);
        Ok(())
    }
}
