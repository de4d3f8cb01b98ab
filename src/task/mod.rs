//! Task definition and execution results.
//!
//! A [`Task`] is either a call to a named function from the
//! [`FunctionRegistry`](registry::FunctionRegistry) or an external program
//! that runs as a group of processes.

pub mod registry;

use crate::error::{PoolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Encodes a value into the wire representation used for arguments and results.
///
/// # Errors
///
/// Returns `PoolError::Codec` if the value cannot be serialized.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decodes a value produced by [`encode`].
///
/// # Errors
///
/// Returns `PoolError::Codec` if the bytes do not hold a `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminant of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Call of a registered function.
    Function,
    /// External program run by a dedicated process group.
    Executable,
}

/// A unit of work.
///
/// Tasks are immutable once built. They cross the fabric as encoded bytes, so
/// the receiving side never shares state with the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Call of a registered function.
    Function(FunctionTask),
    /// External program.
    Executable(ExecutableTask),
}

impl Task {
    /// Starts building a call of the registered function `name`.
    #[must_use]
    pub fn function(name: impl Into<String>) -> FunctionTaskBuilder {
        FunctionTaskBuilder::new(name)
    }

    /// Starts building an executable task.
    #[must_use]
    pub fn executable<P: Into<PathBuf>>(program: P) -> ExecutableTaskBuilder {
        ExecutableTaskBuilder::new(program)
    }

    /// Returns the task ID.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        match self {
            Self::Function(task) => task.id,
            Self::Executable(task) => task.id,
        }
    }

    /// Returns the discriminant.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        match self {
            Self::Function(_) => TaskKind::Function,
            Self::Executable(_) => TaskKind::Executable,
        }
    }

    /// Number of workers the task occupies while it runs.
    #[must_use]
    pub const fn num_workers(&self) -> usize {
        match self {
            Self::Function(_) => 1,
            Self::Executable(task) => task.num_workers,
        }
    }

    /// Program launched by an executable task.
    #[must_use]
    pub fn program(&self) -> Option<&Path> {
        match self {
            Self::Function(_) => None,
            Self::Executable(task) => Some(&task.program),
        }
    }

    /// Deep copy for transfer to another owner.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

impl From<FunctionTask> for Task {
    fn from(task: FunctionTask) -> Self {
        Self::Function(task)
    }
}

impl From<ExecutableTask> for Task {
    fn from(task: ExecutableTask) -> Self {
        Self::Executable(task)
    }
}

/// Keyword arguments of a function task, each value encoded separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kwargs(BTreeMap<String, Vec<u8>>);

impl Kwargs {
    /// Creates an empty set of keyword arguments.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Encodes and stores `value` under `name`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Codec` if the value cannot be serialized.
    pub fn insert<V: Serialize + ?Sized>(&mut self, name: impl Into<String>, value: &V) -> Result<()> {
        self.0.insert(name.into(), encode(value)?);
        Ok(())
    }

    /// Decodes the value stored under `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Codec` if the stored bytes do not hold a `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.0.get(name).map(|bytes| decode(bytes)).transpose()
    }

    /// Returns true when no keyword arguments are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of keyword arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Call of a registered function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionTask {
    id: TaskId,
    name: String,
    args: Vec<u8>,
    kwargs: Kwargs,
    callback: Option<String>,
}

impl FunctionTask {
    /// Creates a call from already encoded positional arguments.
    #[must_use]
    pub fn from_encoded(name: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            args,
            kwargs: Kwargs::new(),
            callback: None,
        }
    }

    /// Returns the task ID.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Registered name of the function.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encoded positional arguments.
    #[must_use]
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Keyword arguments.
    #[must_use]
    pub const fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    /// Registered name of the result callback.
    #[must_use]
    pub fn callback(&self) -> Option<&str> {
        self.callback.as_deref()
    }
}

/// Builder for function tasks.
#[derive(Debug)]
pub struct FunctionTaskBuilder {
    name: String,
    args: Result<Vec<u8>>,
    kwargs: Result<Kwargs>,
    callback: Option<String>,
    num_workers: usize,
}

impl FunctionTaskBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: encode(&()),
            kwargs: Ok(Kwargs::new()),
            callback: None,
            num_workers: 1,
        }
    }

    /// Sets the positional arguments; use a tuple for several.
    #[must_use]
    pub fn args<A: Serialize + ?Sized>(mut self, args: &A) -> Self {
        self.args = encode(args);
        self
    }

    /// Adds a keyword argument.
    #[must_use]
    pub fn kwarg<V: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &V) -> Self {
        if let Ok(kwargs) = self.kwargs.as_mut() {
            if let Err(e) = kwargs.insert(name, value) {
                self.kwargs = Err(e);
            }
        }
        self
    }

    /// Sets a registered function applied to the result on the worker.
    #[must_use]
    pub fn callback(mut self, name: impl Into<String>) -> Self {
        self.callback = Some(name.into());
        self
    }

    /// Sets the worker count. Function tasks accept exactly one.
    #[must_use]
    pub const fn num_workers(mut self, count: usize) -> Self {
        self.num_workers = count;
        self
    }

    /// Builds the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, the worker count is not 1, or
    /// an argument failed to encode.
    pub fn build(self) -> Result<Task> {
        if self.name.is_empty() {
            return Err(PoolError::InvalidTask {
                reason: "Function name not set".to_string(),
            });
        }
        if self.num_workers != 1 {
            return Err(PoolError::InvalidTask {
                reason: format!("num_workers must be 1 for functions; got {}", self.num_workers),
            });
        }

        Ok(Task::Function(FunctionTask {
            id: TaskId::new(),
            name: self.name,
            args: self.args?,
            kwargs: self.kwargs?,
            callback: self.callback,
        }))
    }
}

/// External program run by a group of `num_workers` processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableTask {
    id: TaskId,
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    workdir: Option<PathBuf>,
    num_workers: usize,
    timeout: Option<Duration>,
}

impl ExecutableTask {
    /// Returns the task ID.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the program path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns the arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns the environment variables.
    #[must_use]
    pub const fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Returns the working directory.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Returns the size of the process group.
    #[must_use]
    pub const fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Returns the timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Builder for executable tasks.
#[derive(Debug)]
pub struct ExecutableTaskBuilder {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    workdir: Option<PathBuf>,
    num_workers: usize,
    timeout: Option<Duration>,
}

impl ExecutableTaskBuilder {
    fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            num_workers: 1,
            timeout: None,
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Adds a single argument.
    #[must_use]
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets the environment variables.
    #[must_use]
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Adds a single environment variable.
    #[must_use]
    pub fn env_var<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn workdir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Sets the size of the process group.
    #[must_use]
    pub const fn num_workers(mut self, count: usize) -> Self {
        self.num_workers = count;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the program path is empty or the worker count is zero.
    pub fn build(self) -> Result<Task> {
        if self.program.as_os_str().is_empty() {
            return Err(PoolError::InvalidTask {
                reason: "Program path not set".to_string(),
            });
        }
        if self.num_workers == 0 {
            return Err(PoolError::InvalidTask {
                reason: "num_workers must be a positive integer; got 0".to_string(),
            });
        }

        Ok(Task::Executable(ExecutableTask {
            id: TaskId::new(),
            program: self.program,
            args: self.args,
            env: self.env,
            workdir: self.workdir,
            num_workers: self.num_workers,
            timeout: self.timeout,
        }))
    }
}

/// Result of one process of an executable task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    task_id: TaskId,
    rank: usize,
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    duration: Duration,
}

impl ExecutionResult {
    /// Creates a new execution result.
    #[must_use]
    pub const fn new(
        task_id: TaskId,
        rank: usize,
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id,
            rank,
            exit_code,
            stdout,
            stderr,
            duration,
        }
    }

    /// Returns the task ID.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Rank of the process inside its group.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the exit code (-1 when killed by a signal).
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Returns whether the process succeeded (exit code 0).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the standard output.
    #[must_use]
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    /// Returns the standard error.
    #[must_use]
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Returns the execution duration.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Converts stdout to a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns an error if stdout is not valid UTF-8.
    pub fn stdout_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.stdout).map_err(|_| PoolError::Codec("stdout is not valid UTF-8".to_string()))
    }

    /// Converts stderr to a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns an error if stderr is not valid UTF-8.
    pub fn stderr_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.stderr).map_err(|_| PoolError::Codec("stderr is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_creation() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_function_task_builder() {
        let task = Task::function("add")
            .args(&(2i64, 3i64))
            .kwarg("scale", &10i64)
            .callback("log_result")
            .build()
            .unwrap();

        assert_eq!(task.kind(), TaskKind::Function);
        assert_eq!(task.num_workers(), 1);
        assert!(task.program().is_none());

        let Task::Function(call) = task else {
            panic!("expected a function task");
        };
        assert_eq!(call.name(), "add");
        assert_eq!(decode::<(i64, i64)>(call.args()).unwrap(), (2, 3));
        assert_eq!(call.kwargs().get::<i64>("scale").unwrap(), Some(10));
        assert_eq!(call.kwargs().get::<i64>("missing").unwrap(), None);
        assert_eq!(call.callback(), Some("log_result"));
    }

    #[test]
    fn test_function_task_rejects_multiple_workers() {
        let result = Task::function("add").num_workers(2).build();
        assert!(matches!(result, Err(PoolError::InvalidTask { .. })));
    }

    #[test]
    fn test_function_task_requires_name() {
        assert!(Task::function("").build().is_err());
    }

    #[test]
    fn test_function_task_without_args_encodes_unit() {
        let Task::Function(call) = Task::function("ping").build().unwrap() else {
            panic!("expected a function task");
        };
        decode::<()>(call.args()).unwrap();
        assert!(call.kwargs().is_empty());
    }

    #[test]
    fn test_executable_task_builder() {
        let task = Task::executable("/bin/echo")
            .arg("hello")
            .arg("world")
            .env_var("MODE", "fast")
            .workdir("/tmp")
            .num_workers(3)
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(task.kind(), TaskKind::Executable);
        assert_eq!(task.num_workers(), 3);
        assert_eq!(task.program(), Some(Path::new("/bin/echo")));

        let Task::Executable(exe) = task else {
            panic!("expected an executable task");
        };
        assert_eq!(exe.args(), &["hello", "world"]);
        assert_eq!(exe.env().get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(exe.workdir(), Some(Path::new("/tmp")));
        assert_eq!(exe.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_executable_task_rejects_zero_workers() {
        let result = Task::executable("/bin/true").num_workers(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_copy_is_independent_and_equal() {
        let task = Task::executable("/bin/echo").arg("a").build().unwrap();
        let copy = task.copy();
        assert_eq!(copy, task);
        assert_eq!(copy.id(), task.id());
    }

    #[test]
    fn test_task_crosses_the_wire_unchanged() {
        let task = Task::function("square").args(&7i64).build().unwrap();
        let bytes = encode(&task).unwrap();
        let back: Task = decode(&bytes).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_execution_result() {
        let task_id = TaskId::new();
        let result = ExecutionResult::new(
            task_id,
            0,
            0,
            b"output".to_vec(),
            b"".to_vec(),
            Duration::from_secs(1),
        );

        assert!(result.is_success());
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.rank(), 0);
        assert_eq!(result.stdout_str().unwrap(), "output");
    }
}
