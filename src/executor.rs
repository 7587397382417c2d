use crate::error::{AbortReason, PoolError, TaskError};
use crate::future_task::FutureTask;
use crate::pool::TaskPool;
use crate::task::AsyncTask;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

/// Fire-and-forget executor. Nothing about a task's outcome reaches the caller.
///
/// Cheap to clone and safe to use from many tasks at once.
#[derive(Clone)]
pub struct AsyncExecutor {
  pool: Arc<TaskPool>,
}

impl AsyncExecutor {
  pub fn new(pool: Arc<TaskPool>) -> Self {
    Self { pool }
  }

  pub fn pool(&self) -> &Arc<TaskPool> {
    &self.pool
  }

  /// Hands `future` to the pool. Returns whether the pool admitted it.
  pub fn submit<F>(&self, future: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.try_submit(future).is_ok()
  }

  /// Hands `future` to the pool, reporting why it was refused.
  pub fn try_submit<F>(&self, future: F) -> Result<(), PoolError>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.pool.try_submit(Box::new(AsyncTask::new(future)))
  }
}

/// Executor collecting the outcomes of a batch of futures in submission order.
///
/// Submission and waiting take `&mut self`: an executor belongs to one caller.
/// Several executors may share one pool. A completed wait consumes the recorded
/// batch, so the executor can be reused for the next one. A wait dropped before
/// it completes keeps the batch and whatever it already collected; the next wait
/// picks up where it stopped.
///
/// Dropping the executor aborts every task of the batch that has not finished.
pub struct FutureExecutor<T, E> {
  pool: Arc<TaskPool>,
  tasks: Vec<FutureTask<T, E>>,
  collected: Vec<Result<T, TaskError<E>>>,
}

impl<T, E> FutureExecutor<T, E>
where
  T: Send + 'static,
  E: Send + 'static,
{
  pub fn new(pool: Arc<TaskPool>) -> Self {
    Self {
      pool,
      tasks: Vec::new(),
      collected: Vec::new(),
    }
  }

  pub fn pool(&self) -> &Arc<TaskPool> {
    &self.pool
  }

  /// Number of tasks in the current batch, i.e. recorded since the last completed wait.
  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  pub fn task_ids(&self) -> Vec<u64> {
    self.tasks.iter().map(FutureTask::id).collect()
  }

  /// Records `future` and hands it to the pool. Returns the task's id.
  ///
  /// A task the pool refuses is aborted on the spot, with
  /// [`AbortReason::QueueFull`] or [`AbortReason::PoolClosed`], so waiting on it
  /// still terminates.
  pub fn submit<F>(&mut self, future: F) -> u64
  where
    F: Future<Output = Result<T, E>> + Send + 'static,
  {
    let task = FutureTask::new(future);
    let task_id = task.id();
    self.tasks.push(task.clone());

    if let Err(err) = self.pool.try_submit(Box::new(task.clone())) {
      warn!(pool_name = %self.pool.name(), %task_id, "Future task refused by pool: {}", err);
      task.abort(AbortReason::from(err));
    }
    task_id
  }

  /// Aborts every recorded task that has not finished yet.
  pub fn abort_all(&self, reason: AbortReason) {
    for task in &self.tasks {
      task.abort(reason.clone());
    }
  }

  /// Waits for every recorded task, in submission order.
  ///
  /// The returned vectors are index-aligned with submission order; for each index
  /// exactly one of the value and the error is `Some`.
  pub async fn wait(&mut self) -> (Vec<Option<T>>, Vec<Option<TaskError<E>>>) {
    split(self.wait_results().await)
  }

  /// Like [`wait`](Self::wait), but gives up on the batch after `timeout`.
  ///
  /// The deadline is shared by the whole batch. Once it passes, the task being
  /// waited on reports [`AbortReason::DeadlineExceeded`] but is left alone, and
  /// every later task is aborted and collected without waiting: tasks that
  /// completed in time keep their outcome, the others report
  /// [`AbortReason::DeadlineExceeded`].
  pub async fn wait_with_timeout(&mut self, timeout: Duration) -> (Vec<Option<T>>, Vec<Option<TaskError<E>>>) {
    split(self.wait_results_with_timeout(timeout).await)
  }

  /// Waits for every recorded task, returning one `Result` per task in submission order.
  pub async fn wait_results(&mut self) -> Vec<Result<T, TaskError<E>>> {
    while self.collected.len() < self.tasks.len() {
      let outcome = self.tasks[self.collected.len()].wait_result().await;
      self.collected.push(outcome);
    }
    self.finish_batch()
  }

  /// Like [`wait_with_timeout`](Self::wait_with_timeout), returning one `Result` per task.
  pub async fn wait_results_with_timeout(&mut self, timeout: Duration) -> Vec<Result<T, TaskError<E>>> {
    let timer = tokio::time::sleep(timeout);
    tokio::pin!(timer);

    while self.collected.len() < self.tasks.len() {
      let index = self.collected.len();
      let (outcome, fired) = self.tasks[index].wait_result_with_deadline(timer.as_mut()).await;
      self.collected.push(outcome);

      if fired {
        let unvisited = &self.tasks[index + 1..];
        debug!(
          pool_name = %self.pool.name(),
          task_id = %self.tasks[index].id(),
          remaining = unvisited.len(),
          "Batch deadline exceeded. Aborting remaining tasks."
        );
        for pending in unvisited {
          pending.abort(AbortReason::DeadlineExceeded);
        }
        for pending in unvisited {
          self.collected.push(pending.poll_result());
        }
      }
    }
    self.finish_batch()
  }

  fn finish_batch(&mut self) -> Vec<Result<T, TaskError<E>>> {
    self.tasks.clear();
    std::mem::take(&mut self.collected)
  }
}

impl<T, E> Drop for FutureExecutor<T, E> {
  fn drop(&mut self) {
    let mut cancelled = 0usize;
    for task in &self.tasks {
      if task.abort(AbortReason::Cancelled("executor dropped".to_string())) {
        cancelled += 1;
      }
    }
    if cancelled > 0 {
      debug!(pool_name = %self.pool.name(), cancelled, "FutureExecutor dropped with unfinished tasks.");
    }
  }
}

fn split<T, E>(results: Vec<Result<T, TaskError<E>>>) -> (Vec<Option<T>>, Vec<Option<TaskError<E>>>) {
  let mut values = Vec::with_capacity(results.len());
  let mut errors = Vec::with_capacity(results.len());
  for result in results {
    match result {
      Ok(value) => {
        values.push(Some(value));
        errors.push(None);
      }
      Err(err) => {
        values.push(None);
        errors.push(Some(err));
      }
    }
  }
  (values, errors)
}
