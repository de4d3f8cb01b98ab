//! Demo producer for distpool.
//!
//! Maps `abs` over a few numbers on spawned copies of itself. The same
//! binary serves as the worker program: spawned copies detect their role
//! from the environment and never reach the producer code.
//!
//! Usage: `distpool-demo [--workers N] [--local]`

use distpool::error::{PoolError, Result};
use distpool::executor::{Executor, MapOptions};
use distpool::fabric::tcp::ProcessFabric;
use distpool::task::registry::FunctionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register("abs", |x: i64| Ok::<_, String>(x.abs()))
        .register("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b))
        .register("pid", |_: ()| Ok::<_, String>(std::process::id()))
        .register("sleep_ms", |ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok::<_, String>(ms)
        })
        .register("fail", |message: String| Err::<(), _>(message));
    registry
}

struct Options {
    workers: Option<usize>,
    local: bool,
}

fn parse_args() -> Result<Options> {
    let mut options = Options {
        workers: None,
        local: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--local" => options.local = true,
            "--workers" => {
                let value = args.next().unwrap_or_default();
                let count = value.parse().map_err(|_| PoolError::Config {
                    reason: format!("--workers expects a number, got {value:?}"),
                })?;
                options.workers = Some(count);
            }
            other => {
                return Err(PoolError::Config {
                    reason: format!("Unknown argument {other}"),
                })
            }
        }
    }
    Ok(options)
}

fn run(options: &Options, registry: FunctionRegistry) -> Result<()> {
    let mut builder = Executor::builder().registry(registry);
    if let Some(workers) = options.workers {
        builder = builder.max_workers(workers);
    }
    if !options.local {
        builder = builder.fabric(Arc::new(ProcessFabric::new()?));
    }
    let executor = builder.build()?;
    info!("Pool ready with {} workers", executor.num_workers()?);

    let inputs = vec![-1i64, -2, 3, 4, -5, 6];
    let options = MapOptions::default().with_timeout(Duration::from_secs(5));
    for value in executor.map::<_, i64, _>("abs", vec![inputs], options)? {
        println!("{}", value?);
    }

    executor.shutdown(true, false);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let registry = registry();
    distpool::run_worker_if_spawned(&registry);

    let outcome = parse_args().and_then(|options| run(&options, registry));
    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
}
