//! A Tokio-based bounded-parallelism task pool with two executors: a
//! fire-and-forget [`AsyncExecutor`] and a [`FutureExecutor`] that collects
//! ordered results with batch timeouts and cooperative cancellation.

mod config;
mod error;
mod executor;
mod future_task;
mod pool;
mod task;

pub use config::PoolConfig;
pub use error::{AbortReason, PoolError, TaskError};
pub use executor::{AsyncExecutor, FutureExecutor};
pub use future_task::FutureTask;
pub use pool::TaskPool;
pub use task::{AsyncTask, Task, TaskToExecute};
