//! # distpool: dynamic worker pool for function calls and executables
//!
//! distpool runs tasks on a group of worker processes that it spawns on
//! demand. A task is either a call of a registered function with encoded
//! arguments, or an external executable launched as a group of `k`
//! processes. Submitting a task returns a [`TaskFuture`]; `map` and
//! `starmap` fan a function out over many inputs.
//!
//! ## Quick Start
//!
//! ```no_run
//! use distpool::executor::{Executor, MapOptions};
//! use distpool::fabric::tcp::ProcessFabric;
//! use distpool::task::registry::FunctionRegistry;
//! use std::sync::Arc;
//!
//! fn main() -> distpool::error::Result<()> {
//!     let mut registry = FunctionRegistry::new();
//!     registry.register("abs", |x: i64| Ok::<_, String>(x.abs()));
//!
//!     // Spawned copies of this program serve tasks and exit here.
//!     distpool::run_worker_if_spawned(&registry);
//!
//!     let executor = Executor::builder()
//!         .registry(registry)
//!         .fabric(Arc::new(ProcessFabric::new()?))
//!         .build()?;
//!
//!     let results: Vec<i64> = executor
//!         .map("abs", vec![vec![-1i64, -2, 3]], MapOptions::default())?
//!         .collect::<distpool::error::Result<_>>()?;
//!     println!("{results:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Task**: a function call or an executable, plus the workers it needs
//! - **Executor**: submission API; owns the pool
//! - **Pool**: work queue plus a manager thread that boots the workers
//! - **Fabric**: how workers are spawned and reached (threads or processes)
//! - **ClientWorker / ServerWorker**: the producer and worker sides of the
//!   wire protocol
//! - **LocalThreadPool**: in-process fallback when only one worker is available

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod executor;
pub mod fabric;
pub mod future;
pub mod pool;
pub mod queue;
pub mod task;

pub use config::{PollPolicy, PoolConfig, WorkerSetup};
pub use error::{PoolError, Result, TaskFailure};
pub use executor::{Executor, ExecutorBuilder, MapOptions, MapResults};
pub use future::{as_completed, FutureState, TaskFuture};
pub use pool::run_worker_if_spawned;
pub use task::registry::FunctionRegistry;
pub use task::{ExecutionResult, Task, TaskId};
