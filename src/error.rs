use thiserror::Error;

/// Errors returned when the pool refuses to admit a task.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
  #[error("Task queue is full, task was not admitted")]
  QueueFull,

  #[error("Pool is closed, cannot accept new tasks")]
  PoolClosed,
}

/// Why a future task ended without a value produced by its own function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
  #[error("pool is full")]
  QueueFull,

  #[error("pool closed")]
  PoolClosed,

  #[error("deadline exceeded")]
  DeadlineExceeded,

  #[error("no result yet")]
  NotReady,

  #[error("result already taken")]
  ResultTaken,

  #[error("task panicked: {0}")]
  Panicked(String),

  #[error("cancelled: {0}")]
  Cancelled(String),
}

impl From<PoolError> for AbortReason {
  fn from(err: PoolError) -> Self {
    match err {
      PoolError::QueueFull => AbortReason::QueueFull,
      PoolError::PoolClosed => AbortReason::PoolClosed,
    }
  }
}

/// The failure side of a future task's outcome.
///
/// `Aborted` means the task never meaningfully ran, or its result was discarded
/// by cancellation, a batch deadline, pool shutdown or a panic. Retrying is safe.
/// `Function` wraps the error the task's own future returned; whether to retry
/// is up to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
  #[error("task aborted: {0}")]
  Aborted(AbortReason),

  #[error("task function failed: {0}")]
  Function(E),
}

impl<E> TaskError<E> {
  pub fn is_aborted(&self) -> bool {
    matches!(self, TaskError::Aborted(_))
  }

  pub fn is_function_error(&self) -> bool {
    matches!(self, TaskError::Function(_))
  }

  /// Returns the abort reason, if this is an `Aborted` error.
  pub fn abort_reason(&self) -> Option<&AbortReason> {
    match self {
      TaskError::Aborted(reason) => Some(reason),
      TaskError::Function(_) => None,
    }
  }

  /// Returns the function's own error, if this is a `Function` error.
  pub fn into_function_error(self) -> Option<E> {
    match self {
      TaskError::Function(err) => Some(err),
      TaskError::Aborted(_) => None,
    }
  }
}

impl<E> From<AbortReason> for TaskError<E> {
  fn from(reason: AbortReason) -> Self {
    TaskError::Aborted(reason)
  }
}
