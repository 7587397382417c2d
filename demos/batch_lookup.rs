use grpool::{FutureExecutor, TaskPool};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info};

#[derive(Debug, Clone)]
struct User {
  id: u32,
  name: String,
}

/// Simulated database lookup: slow, occasionally failing, very occasionally panicking.
async fn select_user(id: u32, cost_ms: u64) -> Result<User, String> {
  tokio::time::sleep(Duration::from_millis(cost_ms)).await;

  if cost_ms < 2 {
    panic!("connection refused");
  }
  if cost_ms > 98 {
    return Err(format!("time out: {}ms", cost_ms));
  }

  Ok(User {
    id,
    name: format!("I AM {}", id),
  })
}

async fn batch_select_user(pool: Arc<TaskPool>, ids: &[u32]) -> HashMap<u32, User> {
  let mut executor = FutureExecutor::<User, String>::new(pool);
  let costs: Vec<u64> = {
    let mut rng = rand::rng();
    ids.iter().map(|_| rng.random_range(0..100)).collect()
  };

  for (&id, cost_ms) in ids.iter().zip(costs) {
    executor.submit(select_user(id, cost_ms));
  }

  let (users, errors) = executor.wait_with_timeout(Duration::from_millis(1000)).await;

  let mut user_map = HashMap::new();
  for ((&id, user), err) in ids.iter().zip(users).zip(errors) {
    match (user, err) {
      (Some(user), None) => {
        info!("select user. id: {}, user: {:?}", id, user);
        user_map.insert(user.id, user);
      }
      (_, Some(err)) => error!("select user error. id: {}, err: {}", id, err),
      (None, None) => error!("unknown result. id: {}", id),
    }
  }
  user_map
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Batch Lookup Example ---");

  let pool = TaskPool::new(1000, 5, Handle::current(), "mysql_pool");
  let ids: Vec<u32> = (10000..10100).collect();

  let users = batch_select_user(pool.clone(), &ids).await;
  info!("Found {} of {} users.", users.len(), ids.len());
  info!("user 10005: {:?}", users.get(&10005).map(|user| &user.name));
  info!("user 10020: {:?}", users.get(&10020).map(|user| &user.name));

  pool.close();
  pool.join().await;
  info!("--- Batch Lookup Example End ---");
}
