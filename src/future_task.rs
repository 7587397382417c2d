use crate::error::{AbortReason, TaskError};
use crate::task::{panic_message, Task, TaskToExecute};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{poll_fn, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::Sleep;
use tracing::{debug, error, trace};

lazy_static::lazy_static! {
  static ref NEXT_FUTURE_TASK_ID: AtomicU64 = AtomicU64::new(0);
}

type Outcome<T, E> = Result<T, TaskError<E>>;

struct FutureTaskInner<T, E> {
  task_id: u64,
  work: Mutex<Option<TaskToExecute<Result<T, E>>>>,
  aborted: AtomicBool,
  // Whoever takes the sender owns the single write into the result slot.
  result_sender: Mutex<Option<oneshot::Sender<Outcome<T, E>>>>,
  result_receiver: Mutex<Option<oneshot::Receiver<Outcome<T, E>>>>,
}

/// A task producing `Result<T, E>`, whose outcome is delivered exactly once.
///
/// Clones share the same state: the pool runs one copy while the submitter
/// keeps another to abort it or wait for its outcome. The outcome is decided by
/// a single write into the result slot, so whichever of "the future finished" and
/// "the task was aborted" happens first wins. An abort never interrupts a running
/// future; it only keeps an unstarted one from running, or discards the late
/// result of one already running.
pub struct FutureTask<T, E> {
  inner: Arc<FutureTaskInner<T, E>>,
}

impl<T, E> Clone for FutureTask<T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T, E> fmt::Debug for FutureTask<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FutureTask")
      .field("task_id", &self.inner.task_id)
      .field("aborted", &self.is_aborted())
      .field("finished", &self.is_finished())
      .finish()
  }
}

impl<T, E> FutureTask<T, E> {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.inner.task_id
  }

  pub fn is_aborted(&self) -> bool {
    self.inner.aborted.load(AtomicOrdering::Acquire)
  }

  /// Whether the result slot has been written, by completion or by abort.
  pub fn is_finished(&self) -> bool {
    self.inner.result_sender.lock().is_none()
  }

  /// Aborts the task. Only the first call has any effect.
  ///
  /// Returns `true` if this call decided the task's outcome, `false` if the task
  /// was already aborted or had already completed.
  pub fn abort(&self, reason: AbortReason) -> bool {
    if self
      .inner
      .aborted
      .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
      .is_err()
    {
      return false;
    }
    drop(self.inner.work.lock().take());

    let won = self.fill(Err(TaskError::Aborted(reason.clone())));
    if won {
      debug!(task_id = %self.id(), %reason, "Future task aborted.");
    } else {
      trace!(task_id = %self.id(), %reason, "Abort requested after the task completed, ignored.");
    }
    won
  }

  fn fill(&self, outcome: Outcome<T, E>) -> bool {
    match self.inner.result_sender.lock().take() {
      Some(tx) => {
        // A dropped receiver means nobody is left to observe the outcome.
        let _ = tx.send(outcome);
        true
      }
      None => false,
    }
  }
}

impl<T, E> FutureTask<T, E>
where
  T: Send + 'static,
  E: Send + 'static,
{
  pub fn new<F>(future: F) -> Self
  where
    F: Future<Output = Result<T, E>> + Send + 'static,
  {
    let (result_tx, result_rx) = oneshot::channel();
    Self {
      inner: Arc::new(FutureTaskInner {
        task_id: NEXT_FUTURE_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed),
        work: Mutex::new(Some(Box::pin(future))),
        aborted: AtomicBool::new(false),
        result_sender: Mutex::new(Some(result_tx)),
        result_receiver: Mutex::new(Some(result_rx)),
      }),
    }
  }

  /// Runs the wrapped future and records its outcome.
  ///
  /// Does nothing if the task was aborted or has already been run. A panic in
  /// the future aborts the task with [`AbortReason::Panicked`].
  pub async fn run(&self) {
    if self.is_aborted() {
      trace!(task_id = %self.id(), "Future task aborted before it started, skipping.");
      return;
    }
    let Some(work) = self.inner.work.lock().take() else {
      trace!(task_id = %self.id(), "Future task already ran, skipping.");
      return;
    };

    let mut guard = DropGuard { task: self, armed: true };
    let outcome = match AssertUnwindSafe(work).catch_unwind().await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(err)) => Err(TaskError::Function(err)),
      Err(payload) => {
        guard.armed = false;
        let msg = panic_message(payload.as_ref());
        error!(task_id = %self.id(), "Future task panicked: {}", msg);
        self.abort(AbortReason::Panicked(msg));
        return;
      }
    };
    guard.armed = false;

    if !self.fill(outcome) {
      debug!(task_id = %self.id(), "Future task finished after it was aborted, result discarded.");
    }
  }

  /// Waits until the task has an outcome.
  ///
  /// The outcome can be taken once; later reads yield [`AbortReason::ResultTaken`].
  /// Dropping the returned future before it completes leaves the outcome in place.
  pub async fn wait_result(&self) -> Outcome<T, E> {
    poll_fn(|cx| self.poll_slot(cx)).await
  }

  /// Waits for the outcome, giving up when `timer` fires.
  ///
  /// The timer is meant to be shared by a whole batch, so the deadline is relative
  /// to the batch rather than to this task. Returns the outcome and whether the
  /// timer fired first; on timeout the outcome is [`AbortReason::DeadlineExceeded`]
  /// and the task's own result stays in place for a later [`poll_result`](Self::poll_result).
  pub async fn wait_result_with_deadline(&self, timer: Pin<&mut Sleep>) -> (Outcome<T, E>, bool) {
    tokio::select! {
      biased;
      outcome = poll_fn(|cx| self.poll_slot(cx)) => (outcome, false),
      _ = timer => (Err(AbortReason::DeadlineExceeded.into()), true),
    }
  }

  /// Takes the outcome if there is one, without waiting.
  ///
  /// An empty slot yields [`AbortReason::NotReady`].
  pub fn poll_result(&self) -> Outcome<T, E> {
    let mut slot = self.inner.result_receiver.lock();
    let Some(rx) = slot.as_mut() else {
      return Err(AbortReason::ResultTaken.into());
    };
    match rx.try_recv() {
      Ok(outcome) => {
        slot.take();
        outcome
      }
      Err(TryRecvError::Empty) => Err(AbortReason::NotReady.into()),
      Err(TryRecvError::Closed) => {
        slot.take();
        Err(Self::sender_dropped())
      }
    }
  }

  // The receiver never leaves the slot until it yields, so a cancelled wait loses nothing.
  fn poll_slot(&self, cx: &mut Context<'_>) -> Poll<Outcome<T, E>> {
    let mut slot = self.inner.result_receiver.lock();
    let Some(rx) = slot.as_mut() else {
      return Poll::Ready(Err(AbortReason::ResultTaken.into()));
    };
    match Pin::new(rx).poll(cx) {
      Poll::Ready(received) => {
        slot.take();
        Poll::Ready(received.unwrap_or_else(|_| Err(Self::sender_dropped())))
      }
      Poll::Pending => Poll::Pending,
    }
  }

  fn sender_dropped() -> TaskError<E> {
    TaskError::Aborted(AbortReason::Cancelled("result sender dropped".to_string()))
  }
}

/// Aborts the task if its execution is dropped midway, e.g. when the runtime
/// shuts down, so the waiter is not left hanging.
struct DropGuard<'a, T: Send + 'static, E: Send + 'static> {
  task: &'a FutureTask<T, E>,
  armed: bool,
}

impl<T: Send + 'static, E: Send + 'static> Drop for DropGuard<'_, T, E> {
  fn drop(&mut self) {
    if self.armed {
      self
        .task
        .abort(AbortReason::Cancelled("execution dropped before completion".to_string()));
    }
  }
}

impl<T, E> Task for FutureTask<T, E>
where
  T: Send + 'static,
  E: Send + 'static,
{
  fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
    let task = *self;
    Box::pin(async move { task.run().await })
  }

  fn on_pool_closed(self: Box<Self>) {
    self.abort(AbortReason::PoolClosed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn counting_task(counter: Arc<AtomicUsize>, value: u32) -> FutureTask<u32, String> {
    FutureTask::new(async move {
      counter.fetch_add(1, AtomicOrdering::SeqCst);
      Ok(value)
    })
  }

  #[tokio::test]
  async fn run_delivers_value() {
    let task = counting_task(Arc::new(AtomicUsize::new(0)), 7);
    task.run().await;
    assert!(task.is_finished());
    assert_eq!(task.wait_result().await, Ok(7));
    assert_eq!(task.poll_result(), Err(TaskError::Aborted(AbortReason::ResultTaken)));
  }

  #[tokio::test]
  async fn function_error_is_wrapped() {
    let task: FutureTask<u32, String> = FutureTask::new(async { Err("time out: 99ms".to_string()) });
    task.run().await;
    assert_eq!(task.wait_result().await, Err(TaskError::Function("time out: 99ms".to_string())));
  }

  #[tokio::test]
  async fn panic_becomes_abort() {
    let task: FutureTask<u32, String> = FutureTask::new(async { panic!("connection refused") });
    task.run().await;
    assert!(task.is_aborted());
    assert_eq!(
      task.wait_result().await,
      Err(TaskError::Aborted(AbortReason::Panicked("connection refused".to_string())))
    );
  }

  #[tokio::test]
  async fn abort_before_run_skips_the_future() {
    let counter = Arc::new(AtomicUsize::new(0));
    let task = counting_task(counter.clone(), 1);

    assert!(task.abort(AbortReason::Cancelled("caller gave up".to_string())));
    assert!(!task.abort(AbortReason::PoolClosed));
    task.run().await;

    assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
    assert_eq!(
      task.wait_result().await,
      Err(TaskError::Aborted(AbortReason::Cancelled("caller gave up".to_string())))
    );
  }

  #[tokio::test]
  async fn abort_after_completion_has_no_effect() {
    let task = counting_task(Arc::new(AtomicUsize::new(0)), 3);
    task.run().await;

    assert!(!task.abort(AbortReason::DeadlineExceeded));
    assert!(task.is_aborted());
    assert_eq!(task.wait_result().await, Ok(3));
  }

  #[tokio::test]
  async fn running_twice_runs_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let task = counting_task(counter.clone(), 5);
    task.run().await;
    task.run().await;
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(task.wait_result().await, Ok(5));
  }

  #[tokio::test]
  async fn poll_before_completion_is_not_ready() {
    let task = counting_task(Arc::new(AtomicUsize::new(0)), 9);
    assert_eq!(task.poll_result(), Err(TaskError::Aborted(AbortReason::NotReady)));

    task.run().await;
    assert_eq!(task.poll_result(), Ok(9));
  }

  #[tokio::test]
  async fn abort_while_running_discards_late_result() {
    let task: FutureTask<u32, String> = FutureTask::new(async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(1)
    });
    let runner = task.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(task.abort(AbortReason::Cancelled("stop".to_string())));
    handle.await.unwrap();

    assert_eq!(
      task.wait_result().await,
      Err(TaskError::Aborted(AbortReason::Cancelled("stop".to_string())))
    );
  }

  #[tokio::test]
  async fn deadline_keeps_result_for_later_poll() {
    let task: FutureTask<u32, String> = FutureTask::new(async {
      tokio::time::sleep(Duration::from_millis(40)).await;
      Ok(11)
    });
    let runner = task.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let timer = tokio::time::sleep(Duration::from_millis(5));
    tokio::pin!(timer);
    let (outcome, timed_out) = task.wait_result_with_deadline(timer.as_mut()).await;
    assert!(timed_out);
    assert_eq!(outcome, Err(TaskError::Aborted(AbortReason::DeadlineExceeded)));

    handle.await.unwrap();
    assert_eq!(task.poll_result(), Ok(11));
  }

  #[tokio::test]
  async fn ready_result_wins_over_fired_timer() {
    let task = counting_task(Arc::new(AtomicUsize::new(0)), 2);
    task.run().await;

    let timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(timer);
    timer.as_mut().await;
    let (outcome, timed_out) = task.wait_result_with_deadline(timer.as_mut()).await;
    assert!(!timed_out);
    assert_eq!(outcome, Ok(2));
  }

  #[tokio::test]
  async fn cancelled_wait_leaves_result_readable() {
    let task: FutureTask<u32, String> = FutureTask::new(async {
      tokio::time::sleep(Duration::from_millis(30)).await;
      Ok(9)
    });

    assert!(tokio::time::timeout(Duration::from_millis(5), task.wait_result()).await.is_err());

    let timer = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(timer);
    let deadline_wait = tokio::time::timeout(Duration::from_millis(5), task.wait_result_with_deadline(timer.as_mut()));
    assert!(deadline_wait.await.is_err());

    task.run().await;
    assert_eq!(task.wait_result().await, Ok(9));
  }

  #[tokio::test]
  async fn pool_close_callback_aborts() {
    let task = counting_task(Arc::new(AtomicUsize::new(0)), 4);
    let boxed: Box<dyn Task> = Box::new(task.clone());
    boxed.on_pool_closed();
    assert_eq!(task.wait_result().await, Err(TaskError::Aborted(AbortReason::PoolClosed)));
  }

  #[test]
  fn ids_are_unique() {
    let a = counting_task(Arc::new(AtomicUsize::new(0)), 0);
    let b = counting_task(Arc::new(AtomicUsize::new(0)), 0);
    assert_ne!(a.id(), b.id());
    assert_eq!(a.clone().id(), a.id());
  }
}
