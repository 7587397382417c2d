use grpool::{AsyncExecutor, TaskPool};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

async fn send_log(index: usize, message: String, delay_ms: u64) {
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  info!("[Task {}] send log finish. msg: {}", index, message);
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Log Shipping Example ---");

  let pool = TaskPool::new(1000, 5, Handle::current(), "log_pool");
  let executor = AsyncExecutor::new(pool.clone());
  let shipped = Arc::new(AtomicUsize::new(0));

  let messages: Vec<String> = (0..20).map(|i| format!("i am msg {}", i)).collect();
  let delays: Vec<u64> = {
    let mut rng = rand::rng();
    messages.iter().map(|_| rng.random_range(20..40)).collect()
  };

  for (index, (message, delay_ms)) in messages.into_iter().zip(delays).enumerate() {
    let shipped = shipped.clone();
    let admitted = executor.submit(async move {
      send_log(index, message, delay_ms).await;
      shipped.fetch_add(1, Ordering::SeqCst);
    });
    if !admitted {
      warn!("Log {} dropped: pool refused it.", index);
    }
  }

  while shipped.load(Ordering::SeqCst) < 20 {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  let drained = pool.close();
  pool.join().await;
  info!("All logs shipped. Pool closed, {} task(s) drained.", drained);
  info!("--- Log Shipping Example End ---");
}
