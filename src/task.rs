use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, warn};

/// The type of future that the pool executes.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// A unit of work the pool can schedule.
///
/// The pool calls exactly one of `run` or `on_pool_closed` for every task it
/// admitted: `run` when an executor picks the task up, `on_pool_closed` when the
/// pool is closed while the task is still buffered.
pub trait Task: Send + 'static {
  fn run(self: Box<Self>) -> BoxFuture<'static, ()>;

  fn on_pool_closed(self: Box<Self>);
}

/// Fire-and-forget task. Its outcome, including a panic, is only logged.
pub struct AsyncTask {
  future: TaskToExecute<()>,
}

impl AsyncTask {
  pub fn new<F>(future: F) -> Self
  where
    F: Future<Output = ()> + Send + 'static,
  {
    Self {
      future: Box::pin(future),
    }
  }
}

impl Task for AsyncTask {
  fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
      if let Err(payload) = AssertUnwindSafe(self.future).catch_unwind().await {
        error!("Async task panicked: {}", panic_message(payload.as_ref()));
      }
    })
  }

  fn on_pool_closed(self: Box<Self>) {
    warn!("Pool closed before async task could run, task dropped.");
  }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    (*msg).to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
