use std::num::NonZeroUsize;

use tokio::sync::Semaphore;

/// Construction parameters for a [`TaskPool`](crate::TaskPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Name used in log fields and spans.
  pub name: String,
  /// Maximum number of tasks buffered while waiting for an executor.
  pub buffer_size: usize,
  /// Maximum number of tasks running at once, the master included. Clamped to at
  /// least 1, and to at most one more than the number of permits a Tokio semaphore can hold.
  pub max_workers: usize,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "grpool".to_string(),
      buffer_size: 1000,
      max_workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
    }
  }
}

impl PoolConfig {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ..Self::default()
    }
  }

  pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
    self.buffer_size = buffer_size;
    self
  }

  pub fn with_max_workers(mut self, max_workers: usize) -> Self {
    self.max_workers = max_workers;
    self
  }

  /// The worker bound actually enforced by the pool. The master needs no permit.
  pub(crate) fn effective_max_workers(&self) -> usize {
    self.max_workers.clamp(1, Semaphore::MAX_PERMITS + 1)
  }
}
