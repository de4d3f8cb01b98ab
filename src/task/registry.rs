//! Named functions callable from any process of the pool.
//!
//! Producer and workers run the same program and build the same registry, so
//! a [`FunctionTask`] only needs to carry the function name and its encoded
//! arguments.

use crate::error::{PoolError, Result, TaskFailure};
use crate::task::{decode, encode, FunctionTask, Kwargs};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Type-erased registered function: encoded args and kwargs in, encoded result out.
pub type Handler = Arc<dyn Fn(&[u8], &Kwargs) -> std::result::Result<Vec<u8>, TaskFailure> + Send + Sync>;

/// Outcome of running a task: an encoded value or a failure.
pub type CallOutcome = std::result::Result<Vec<u8>, TaskFailure>;

/// Table of functions that function tasks may name.
///
/// # Example
///
/// ```
/// use distpool::task::registry::FunctionRegistry;
/// use distpool::task::{decode, Task};
///
/// let mut registry = FunctionRegistry::new();
/// registry.register("square", |x: i64| Ok::<_, String>(x * x));
///
/// let Task::Function(call) = Task::function("square").args(&4i64).build().unwrap() else {
///     unreachable!()
/// };
/// let value = registry.call(&call).unwrap();
/// assert_eq!(decode::<i64>(&value).unwrap(), 16);
/// ```
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Handler>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function of positional arguments.
    ///
    /// Several arguments are passed as a tuple `A`.
    pub fn register<A, R, E, F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        E: fmt::Display,
        F: Fn(A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        self.register_with_kwargs(name, move |args: A, _: &Kwargs| function(args))
    }

    /// Registers a function that also reads keyword arguments.
    pub fn register_with_kwargs<A, R, E, F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        E: fmt::Display,
        F: Fn(A, &Kwargs) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let handler: Handler = Arc::new(move |args: &[u8], kwargs: &Kwargs| {
            let args: A = decode(args).map_err(|e| TaskFailure::execution(format!("{label}: bad arguments: {e}")))?;
            let value = function(args, kwargs).map_err(|e| TaskFailure::execution(e.to_string()))?;
            encode(&value).map_err(|e| TaskFailure::execution(format!("{label}: bad result: {e}")))
        });
        self.register_handler(name, handler)
    }

    /// Registers an already type-erased handler.
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Handler) -> &mut Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!("Function {name} registered twice; keeping the latest");
        }
        self
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Checks that `task` and its callback name registered functions.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownFunction` for the first missing name.
    pub fn validate(&self, task: &FunctionTask) -> Result<()> {
        for name in std::iter::once(task.name()).chain(task.callback()) {
            if !self.contains(name) {
                return Err(PoolError::UnknownFunction {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Runs a function task, then its callback on the result.
    ///
    /// Errors and panics inside the function become an execution failure;
    /// they never unwind into the caller.
    ///
    /// # Errors
    ///
    /// Returns the failure describing why the call did not produce a value.
    pub fn call(&self, task: &FunctionTask) -> CallOutcome {
        debug!("Calling {}({} bytes, {} kwargs)", task.name(), task.args().len(), task.kwargs().len());
        let value = self.invoke(task.name(), task.args(), task.kwargs())?;
        match task.callback() {
            Some(callback) => self.invoke(callback, &value, &Kwargs::new()),
            None => Ok(value),
        }
    }

    fn invoke(&self, name: &str, args: &[u8], kwargs: &Kwargs) -> CallOutcome {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| TaskFailure::execution(format!("Unknown function: {name}")))?;

        match catch_unwind(AssertUnwindSafe(|| handler(args, kwargs))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!("Function {name} panicked: {message}");
                Err(TaskFailure::execution(format!("{name} panicked: {message}")))
            }
        }
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::task::Task;

    fn call_of(task: Task) -> FunctionTask {
        match task {
            Task::Function(call) => call,
            Task::Executable(_) => panic!("expected a function task"),
        }
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry
            .register("square", |x: i64| Ok::<_, String>(x * x))
            .register("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b))
            .register("fail", |_: ()| Err::<(), _>("always fails"))
            .register("panic", |_: ()| -> std::result::Result<(), String> { panic!("kaboom") })
            .register("negate", |x: i64| Ok::<_, String>(-x))
            .register_with_kwargs("scaled", |x: i64, kwargs: &Kwargs| {
                let scale = kwargs.get::<i64>("scale").map_err(|e| e.to_string())?.unwrap_or(1);
                Ok::<_, String>(x * scale)
            });
        registry
    }

    #[test]
    fn test_call_positional() {
        let call = call_of(Task::function("add").args(&(2i64, 40i64)).build().unwrap());
        let value = registry().call(&call).unwrap();
        assert_eq!(decode::<i64>(&value).unwrap(), 42);
    }

    #[test]
    fn test_call_with_kwargs() {
        let call = call_of(Task::function("scaled").args(&5i64).kwarg("scale", &3i64).build().unwrap());
        let value = registry().call(&call).unwrap();
        assert_eq!(decode::<i64>(&value).unwrap(), 15);
    }

    #[test]
    fn test_callback_replaces_result() {
        let call = call_of(Task::function("square").args(&3i64).callback("negate").build().unwrap());
        let value = registry().call(&call).unwrap();
        assert_eq!(decode::<i64>(&value).unwrap(), -9);
    }

    #[test]
    fn test_error_becomes_execution_failure() {
        let call = call_of(Task::function("fail").build().unwrap());
        let failure = registry().call(&call).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Execution);
        assert_eq!(failure.message, "always fails");
    }

    #[test]
    fn test_panic_is_contained() {
        let call = call_of(Task::function("panic").build().unwrap());
        let failure = registry().call(&call).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Execution);
        assert!(failure.message.contains("kaboom"));
    }

    #[test]
    fn test_unknown_function() {
        let call = call_of(Task::function("nope").build().unwrap());
        assert!(registry().call(&call).is_err());
        assert!(matches!(
            registry().validate(&call),
            Err(PoolError::UnknownFunction { ref name }) if name == "nope"
        ));
    }

    #[test]
    fn test_validate_checks_callback() {
        let call = call_of(Task::function("square").callback("missing").build().unwrap());
        assert!(registry().validate(&call).is_err());
    }

    #[test]
    fn test_bad_arguments_fail_cleanly() {
        let call = FunctionTask::from_encoded("add", vec![1, 2]);
        let failure = registry().call(&call).unwrap_err();
        assert!(failure.message.contains("bad arguments"));
    }
}
