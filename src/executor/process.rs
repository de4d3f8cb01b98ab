//! Process groups for executable tasks.
//!
//! An executable task asking for `k` workers runs as `k` copies of its
//! program, each told its place in the group through `DISTPOOL_GROUP_RANK`
//! and `DISTPOOL_GROUP_SIZE`.

use crate::error::{PoolError, Result, TaskFailure};
use crate::fabric::{GroupOutcome, ProcessGroup};
use crate::task::{ExecutableTask, ExecutionResult, TaskId};
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Environment variable holding a member's rank inside its group.
pub const GROUP_RANK_ENV: &str = "DISTPOOL_GROUP_RANK";

/// Environment variable holding the size of the group.
pub const GROUP_SIZE_ENV: &str = "DISTPOOL_GROUP_SIZE";

/// Starts and supervises process groups on a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use distpool::executor::process::GroupLauncher;
/// use distpool::task::Task;
///
/// let launcher = GroupLauncher::new().unwrap();
/// let Task::Executable(task) = Task::executable("/bin/hostname").num_workers(2).build().unwrap() else {
///     unreachable!()
/// };
/// let results = launcher.run(&task).unwrap();
/// assert_eq!(results.len(), 2);
/// ```
#[derive(Clone)]
pub struct GroupLauncher {
    runtime: Arc<Runtime>,
}

impl GroupLauncher {
    /// Creates a launcher with its own runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("distpool-launcher")
            .enable_all()
            .build()?;
        Ok(Self::from_runtime(Arc::new(runtime)))
    }

    /// Creates a launcher on an existing runtime.
    #[must_use]
    pub const fn from_runtime(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Validates that the binary exists and is executable.
    fn validate_binary(path: &Path) -> std::result::Result<(), String> {
        // Bare names are resolved through PATH at spawn time.
        if path.components().count() == 1 && !path.exists() {
            return Ok(());
        }
        if !path.exists() {
            return Err("binary not found".to_string());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = path.metadata().map_err(|e| e.to_string())?;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err("binary is not executable".to_string());
            }
        }

        Ok(())
    }

    /// Starts every member of the group.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Spawn` if any member fails to start; members
    /// already started are killed.
    pub fn launch(&self, task: &ExecutableTask) -> Result<RunningGroup> {
        let task_id = task.id();
        let program = task.program();
        let size = task.num_workers();
        debug!("Launching task {task_id}: {} x {size}", program.display());

        Self::validate_binary(program).map_err(|reason| PoolError::Spawn {
            program: program.to_path_buf(),
            reason,
        })?;

        let _guard = self.runtime.enter();
        let mut children = Vec::with_capacity(size);
        for rank in 0..size {
            let mut cmd = Command::new(program);
            cmd.args(task.args())
                .envs(task.env().iter())
                .env(GROUP_RANK_ENV, rank.to_string())
                .env(GROUP_SIZE_ENV, size.to_string())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .stdin(Stdio::null())
                .kill_on_drop(true);
            if let Some(dir) = task.workdir() {
                cmd.current_dir(dir);
            }

            // Dropping the children started so far kills them.
            let child = cmd.spawn().map_err(|e| {
                error!("Failed to spawn rank {rank} of task {task_id}: {e}");
                PoolError::Spawn {
                    program: program.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
            children.push(child);
        }

        let start = Instant::now();
        let handles: Vec<JoinHandle<std::io::Result<Output>>> = children
            .into_iter()
            .map(|child| self.runtime.spawn(child.wait_with_output()))
            .collect();

        let (result_tx, result_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.runtime.spawn(supervise(handles, task_id, task.timeout(), start, kill_rx, result_tx));

        info!("Started {size} processes for task {task_id}");
        Ok(RunningGroup {
            task_id,
            result: Some(result_rx),
            kill: Some(kill_tx),
        })
    }

    /// Runs the group to completion, blocking the calling thread.
    ///
    /// Must not be called from inside an async context.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Spawn` if the group cannot start; failures while
    /// running come back as the outcome's `Err`.
    pub fn run(&self, task: &ExecutableTask) -> Result<Vec<ExecutionResult>> {
        self.launch(task)?.wait().map_err(|failure| failure.into_error(Some(task.program().to_path_buf())))
    }
}

impl std::fmt::Debug for GroupLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupLauncher").finish_non_exhaustive()
    }
}

async fn supervise(
    handles: Vec<JoinHandle<std::io::Result<Output>>>,
    task_id: TaskId,
    timeout: Option<Duration>,
    start: Instant,
    kill: oneshot::Receiver<()>,
    result: oneshot::Sender<GroupOutcome>,
) {
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    let gathered = async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, gather(handles, task_id, start))
                .await
                .unwrap_or_else(|_| {
                    warn!("Task {task_id} timed out after {limit:?}");
                    Err(TaskFailure::execution(format!("Timed out after {limit:?}")))
                }),
            None => gather(handles, task_id, start).await,
        }
    };

    let outcome = tokio::select! {
        outcome = gathered => outcome,
        _ = kill => Err(TaskFailure::execution("Process group killed")),
    };

    // Aborting drops the children, which kills them.
    for abort in aborts {
        abort.abort();
    }
    if result.send(outcome).is_err() {
        debug!("Nobody waits for task {task_id} anymore");
    }
}

async fn gather(
    handles: Vec<JoinHandle<std::io::Result<Output>>>,
    task_id: TaskId,
    start: Instant,
) -> GroupOutcome {
    let mut results = Vec::with_capacity(handles.len());
    for (rank, handle) in handles.into_iter().enumerate() {
        let output = match handle.await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("Failed to collect rank {rank} of task {task_id}: {e}");
                return Err(TaskFailure::execution(format!("Rank {rank}: {e}")));
            }
            Err(e) => return Err(TaskFailure::execution(format!("Rank {rank} aborted: {e}"))),
        };
        let exit_code = output.status.code().unwrap_or(-1);
        let duration = start.elapsed();
        debug!("Task {task_id} rank {rank} exited with {exit_code} after {duration:?}");
        results.push(ExecutionResult::new(task_id, rank, exit_code, output.stdout, output.stderr, duration));
    }
    Ok(results)
}

/// Handle to a started group.
///
/// Dropping it kills members that are still running.
#[derive(Debug)]
pub struct RunningGroup {
    task_id: TaskId,
    result: Option<oneshot::Receiver<GroupOutcome>>,
    kill: Option<oneshot::Sender<()>>,
}

impl RunningGroup {
    /// Blocks until every member exited.
    pub fn wait(mut self) -> GroupOutcome {
        let Some(result) = self.result.take() else {
            return Err(TaskFailure::execution("Outcome already taken"));
        };
        result
            .blocking_recv()
            .unwrap_or_else(|_| Err(TaskFailure::execution("Process group supervisor vanished")))
    }
}

impl ProcessGroup for RunningGroup {
    fn try_wait(&mut self) -> Option<GroupOutcome> {
        let receiver = self.result.as_mut()?;
        let outcome = match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Err(TaskFailure::execution("Process group supervisor vanished"))
            }
        };
        self.result = None;
        Some(outcome)
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            info!("Killing process group of task {}", self.task_id);
            let _ = kill.send(());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn executable(task: Task) -> ExecutableTask {
        match task {
            Task::Executable(exe) => exe,
            Task::Function(_) => panic!("expected an executable task"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_group_members_get_their_rank() {
        let launcher = GroupLauncher::new().unwrap();
        let task = executable(
            Task::executable("/bin/sh")
                .arg("-c")
                .arg("echo $DISTPOOL_GROUP_RANK/$DISTPOOL_GROUP_SIZE")
                .num_workers(3)
                .build()
                .unwrap(),
        );

        let results = launcher.run(&task).unwrap();
        assert_eq!(results.len(), 3);
        for (rank, result) in results.iter().enumerate() {
            assert!(result.is_success());
            assert_eq!(result.rank(), rank);
            assert_eq!(result.task_id(), task.id());
            assert_eq!(result.stdout_str().unwrap().trim(), format!("{rank}/3"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_a_result() {
        let launcher = GroupLauncher::new().unwrap();
        let task = executable(Task::executable("/bin/sh").arg("-c").arg("exit 42").build().unwrap());

        let results = launcher.run(&task).unwrap();
        assert!(!results[0].is_success());
        assert_eq!(results[0].exit_code(), 42);
    }

    #[cfg(unix)]
    #[test]
    fn test_env_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = GroupLauncher::new().unwrap();
        let task = executable(
            Task::executable("/bin/sh")
                .arg("-c")
                .arg("echo $MODE; pwd")
                .env_var("MODE", "fast")
                .workdir(dir.path())
                .build()
                .unwrap(),
        );

        let results = launcher.run(&task).unwrap();
        let stdout = results[0].stdout_str().unwrap().to_string();
        let mut lines = stdout.lines();
        assert_eq!(lines.next(), Some("fast"));
        let reported = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let launcher = GroupLauncher::new().unwrap();
        let task = executable(Task::executable("/nonexistent/binary").build().unwrap());

        let result = launcher.launch(&task);
        assert!(matches!(result, Err(PoolError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_fails_group() {
        let launcher = GroupLauncher::new().unwrap();
        let task = executable(
            Task::executable("/bin/sleep")
                .arg("10")
                .num_workers(2)
                .timeout(Duration::from_millis(100))
                .build()
                .unwrap(),
        );

        let started = Instant::now();
        let failure = launcher.launch(&task).unwrap().wait().unwrap_err();
        assert!(failure.message.contains("Timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_try_wait_and_kill() {
        let launcher = GroupLauncher::new().unwrap();
        let task = executable(Task::executable("/bin/sleep").arg("10").build().unwrap());

        let mut group = launcher.launch(&task).unwrap();
        assert!(group.try_wait().is_none());
        group.kill();

        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = loop {
            if let Some(outcome) = group.try_wait() {
                break outcome;
            }
            assert!(Instant::now() < deadline, "group did not stop");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert!(outcome.unwrap_err().message.contains("killed"));
        assert!(group.try_wait().is_none());
    }
}
