use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::task::{panic_message, Task};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use flume::{Receiver, Sender, TrySendError};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// State shared between the pool handle, its master loop and its workers.
struct PoolShared {
  pool_name: Arc<String>,
  buffer_size: usize,
  max_workers: usize,
  closed: AtomicBool,
  // Taken on close. Submitters hold the read lock while sending, so nothing can
  // slip into the queue after close has drained it.
  task_queue_tx: RwLock<Option<Sender<Box<dyn Task>>>>,
  task_queue_rx: Receiver<Box<dyn Task>>,
  // W - 1 permits: the master is an executor of its own.
  worker_permits: Arc<Semaphore>,
  shutdown_token: CancellationToken,
}

/// A bounded-parallelism pool of tasks.
///
/// The pool has one permanent master loop and up to `max_workers - 1` transient
/// workers. The master pulls tasks off a bounded queue; when the queue is empty
/// right after a pull it runs the task itself, otherwise it hands the task to a
/// freshly spawned worker if a permit is free, and runs it itself if not. A
/// worker keeps taking tasks off the queue in competition with the master and
/// exits as soon as it finds the queue empty.
///
/// Submission never blocks, and the pool is safe to share between submitters.
pub struct TaskPool {
  shared: Arc<PoolShared>,
  master_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskPool {
  /// Creates a pool buffering up to `buffer_size` tasks and running at most
  /// `max_workers` of them at once (clamped to at least 1).
  ///
  /// The master loop is spawned on `tokio_handle` right away.
  pub fn new(buffer_size: usize, max_workers: usize, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    Self::with_config(
      PoolConfig::new(pool_name)
        .with_buffer_size(buffer_size)
        .with_max_workers(max_workers),
      tokio_handle,
    )
  }

  pub fn with_config(config: PoolConfig, tokio_handle: TokioHandle) -> Arc<Self> {
    let max_workers = config.effective_max_workers();
    let (tx, rx) = flume::bounded(config.buffer_size);

    let shared = Arc::new(PoolShared {
      pool_name: Arc::new(config.name),
      buffer_size: config.buffer_size,
      max_workers,
      closed: AtomicBool::new(false),
      task_queue_tx: RwLock::new(Some(tx)),
      task_queue_rx: rx,
      worker_permits: Arc::new(Semaphore::new(max_workers - 1)),
      shutdown_token: CancellationToken::new(),
    });

    let master_span = info_span!("task_pool_master", name = %*shared.pool_name);
    let master_join_handle = tokio_handle.spawn(
      PoolShared::run_master_loop(shared.clone(), tokio_handle.clone()).instrument(master_span),
    );

    Arc::new(Self {
      shared,
      master_join_handle: Mutex::new(Some(master_join_handle)),
    })
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn buffer_size(&self) -> usize {
    self.shared.buffer_size
  }

  pub fn max_workers(&self) -> usize {
    self.shared.max_workers
  }

  /// Returns the current number of tasks waiting in the queue.
  pub fn queued_task_count(&self) -> usize {
    self.shared.task_queue_rx.len()
  }

  /// Returns the number of live workers, not counting the master.
  pub fn active_worker_count(&self) -> usize {
    (self.shared.max_workers - 1).saturating_sub(self.shared.worker_permits.available_permits())
  }

  /// Offers a task to the queue without waiting.
  ///
  /// # Errors
  /// Returns `PoolError::QueueFull` if the queue already holds `buffer_size` tasks.
  /// Returns `PoolError::PoolClosed` if the pool has been closed.
  ///
  /// A rejected task is dropped without any callback.
  pub fn try_submit(&self, task: Box<dyn Task>) -> Result<(), PoolError> {
    self.shared.try_submit(task)
  }

  /// Offers a task to the queue without waiting. Returns whether it was admitted.
  pub fn submit(&self, task: Box<dyn Task>) -> bool {
    self.try_submit(task).is_ok()
  }

  /// Closes the pool.
  ///
  /// Stops admission, stops the master loop and hands every task still buffered
  /// to its `on_pool_closed` callback. Tasks already running are left to finish.
  /// Returns the number of buffered tasks drained; repeated calls drain nothing.
  pub fn close(&self) -> usize {
    self.shared.close()
  }

  pub fn is_closed(&self) -> bool {
    self.shared.is_closed()
  }

  /// Waits for the master loop to terminate. Returns immediately if it was
  /// already awaited.
  pub async fn join(&self) {
    let handle_to_await = self.master_join_handle.lock().take();

    if let Some(handle) = handle_to_await {
      if let Err(join_error) = handle.await {
        error!(pool_name = %self.name(), "Error joining master loop: {:?}", join_error);
      } else {
        debug!(pool_name = %self.name(), "Master loop joined.");
      }
    } else {
      trace!(pool_name = %self.name(), "Master join handle already taken.");
    }
  }
}

impl Drop for TaskPool {
  fn drop(&mut self) {
    if !self.shared.is_closed() {
      info!(pool_name = %self.name(), "TaskPool dropped. Closing implicitly.");
      self.shared.close();
    }
  }
}

impl PoolShared {
  fn is_closed(&self) -> bool {
    self.closed.load(AtomicOrdering::Acquire)
  }

  fn try_submit(&self, task: Box<dyn Task>) -> Result<(), PoolError> {
    if self.is_closed() {
      warn!(pool_name = %self.pool_name, "Submit: Attempted to submit task to a closed pool.");
      return Err(PoolError::PoolClosed);
    }

    let sender_guard = self.task_queue_tx.read();
    let Some(tx) = sender_guard.as_ref() else {
      warn!(pool_name = %self.pool_name, "Submit: Attempted to submit task to a closed pool.");
      return Err(PoolError::PoolClosed);
    };

    match tx.try_send(task) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(_)) => {
        debug!(pool_name = %self.pool_name, buffer_size = self.buffer_size, "Submit: Task queue is full.");
        Err(PoolError::QueueFull)
      }
      Err(TrySendError::Disconnected(_)) => Err(PoolError::PoolClosed),
    }
  }

  fn close(&self) -> usize {
    if self
      .closed
      .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
      .is_err()
    {
      trace!(pool_name = %self.pool_name, "Close already performed.");
      return 0;
    }

    self.shutdown_token.cancel();
    drop(self.task_queue_tx.write().take());

    let mut drained = 0usize;
    while let Ok(task) = self.task_queue_rx.try_recv() {
      task.on_pool_closed();
      drained += 1;
    }
    info!(pool_name = %self.pool_name, drained, "Pool closed. Drained {} buffered task(s).", drained);
    drained
  }

  async fn run_master_loop(shared: Arc<PoolShared>, tokio_handle: TokioHandle) {
    info!(name = %*shared.pool_name, "Master loop started.");

    let dispatch = AssertUnwindSafe(Self::dispatch(&shared, &tokio_handle)).catch_unwind().await;
    if let Err(payload) = dispatch {
      error!(name = %*shared.pool_name, "Master loop panicked: {}", panic_message(payload.as_ref()));
    }

    shared.close();
    info!(name = %*shared.pool_name, "Master loop stopped.");
  }

  async fn dispatch(shared: &Arc<PoolShared>, tokio_handle: &TokioHandle) {
    loop {
      if shared.is_closed() {
        break;
      }

      let task = tokio::select! {
        biased;

        _ = shared.shutdown_token.cancelled() => {
          info!(name = %*shared.pool_name, "Shutdown signal received. Master loop terminating.");
          break;
        }

        recv_result = shared.task_queue_rx.recv_async() => {
          match recv_result {
            Ok(task) => task,
            Err(_) => {
              info!(name = %*shared.pool_name, "Task queue disconnected. Master loop terminating.");
              break;
            }
          }
        }
      };

      if shared.task_queue_rx.is_empty() {
        trace!(name = %*shared.pool_name, "Queue empty after pull. Running task on master.");
        execute(&shared.pool_name, task).await;
        continue;
      }

      match shared.worker_permits.clone().try_acquire_owned() {
        Ok(permit) => {
          debug!(
            name = %*shared.pool_name,
            queued = shared.task_queue_rx.len(),
            "Spawning worker. Available permits: {}",
            shared.worker_permits.available_permits()
          );
          let worker_span = info_span!("task_pool_worker", name = %*shared.pool_name);
          tokio_handle.spawn(Self::run_worker_loop(shared.clone(), task, permit).instrument(worker_span));
        }
        Err(_) => {
          trace!(name = %*shared.pool_name, "No worker permit available. Running task on master.");
          execute(&shared.pool_name, task).await;
        }
      }
    }
  }

  async fn run_worker_loop(shared: Arc<PoolShared>, first_task: Box<dyn Task>, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    execute(&shared.pool_name, first_task).await;

    while !shared.is_closed() {
      match shared.task_queue_rx.try_recv() {
        Ok(task) => execute(&shared.pool_name, task).await,
        Err(_) => break,
      }
    }
    trace!(name = %*shared.pool_name, "Worker found no more work. Exiting and releasing permit.");
  }
}

/// Runs one task, containing any panic that escapes it.
async fn execute(pool_name: &str, task: Box<dyn Task>) {
  let result = AssertUnwindSafe(async move { task.run().await }).catch_unwind().await;
  if let Err(payload) = result {
    error!(pool_name = %pool_name, "Task panicked in pool executor: {}", panic_message(payload.as_ref()));
  }
}
