use sentry_pool::{Outcome, WorkerPool};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

// Collatz steps for `n`, resolved one continuation per step.
fn collatz(n: u64, steps: u32) -> Outcome<String> {
  if n == 1 {
    return Outcome::done(format!("reached 1 after {} steps", steps));
  }
  let next = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
  Outcome::then(move || collatz(next, steps + 1))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Sentry Batch Example ---");

  let pool = WorkerPool::<String>::with_executors("sentry_batch_pool", Handle::current(), 4)
    .expect("fresh pool should spawn");

  let sentry = pool.sentry().expect("pool is running");
  for seed in [6u64, 7, 27, 97] {
    sentry
      .guard(move || {
        info!("Job for seed {} starting", seed);
        collatz(seed, 0)
      })
      .await;
  }
  sentry
    .guard(|| {
      std::thread::sleep(Duration::from_millis(50));
      Outcome::done("plain job finished".to_string())
    })
    .await;

  info!("Batch submitted. Waiting on the sentry...");
  for (position, value) in sentry.wait().await.into_iter().enumerate() {
    info!("Completed #{}: {:?}", position, value);
  }

  info!("Stopping pool (drain)...");
  pool.stop().await.expect("pool was running");
  info!("--- Sentry Batch Example End ---");
}
