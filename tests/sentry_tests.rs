use rand::Rng;
use sentry_pool::{Outcome, Sentry, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

// Helper to initialize tracing for tests
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sentry_pool=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

fn sorted(mut values: Vec<Option<String>>) -> Vec<Option<String>> {
  values.sort();
  values
}

#[tokio::test]
async fn test_sentry_collects_plain_and_continued_results() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::new("test_sentry_scenario", tokio::runtime::Handle::current());
  pool.spawn(2).unwrap();

  let sentry = Sentry::new(&pool).expect("Pool is running.");
  sentry.guard(|| Outcome::done("A-done".to_string())).await;
  sentry
    .guard(|| Outcome::then(|| Outcome::done("B-done".to_string())))
    .await;

  let results = timeout(WAIT_TIMEOUT, sentry.wait()).await.expect("Sentry wait hung.");
  assert_eq!(
    sorted(results),
    vec![Some("A-done".to_string()), Some("B-done".to_string())]
  );

  timeout(WAIT_TIMEOUT, pool.wait()).await.expect("Stop round hung.").unwrap();
  assert!(!pool.is_running());
}

#[tokio::test]
async fn test_sentry_on_idle_pool_is_none() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::new("test_sentry_idle", tokio::runtime::Handle::current());
  assert!(Sentry::new(&pool).is_none());
  assert!(pool.sentry().is_none());

  pool.spawn(1).unwrap();
  assert!(pool.sentry().is_some());
  pool.wait().await.unwrap();
  assert!(pool.sentry().is_none());
}

#[tokio::test]
async fn test_empty_sentry_wait_returns_immediately() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::with_executors("test_sentry_empty", tokio::runtime::Handle::current(), 1)
    .unwrap();

  let sentry = pool.sentry().unwrap();
  let results = timeout(Duration::from_millis(100), sentry.wait())
    .await
    .expect("Wait on an empty sentry should not block.");
  assert!(results.is_empty());

  pool.wait().await.unwrap();
}

#[tokio::test]
async fn test_three_deep_chain_records_only_final_value() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::with_executors("test_sentry_chain", tokio::runtime::Handle::current(), 2)
    .unwrap();
  let steps = Arc::new(AtomicUsize::new(0));

  let sentry = pool.sentry().unwrap();
  let s = steps.clone();
  sentry
    .guard(move || {
      s.fetch_add(1, Ordering::SeqCst);
      Outcome::then(move || {
        s.fetch_add(1, Ordering::SeqCst);
        Outcome::then(move || {
          s.fetch_add(1, Ordering::SeqCst);
          Outcome::then(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Outcome::done("fourth".to_string())
          })
        })
      })
    })
    .await;

  let results = timeout(WAIT_TIMEOUT, sentry.wait()).await.expect("Sentry wait hung.");
  assert_eq!(results, vec![Some("fourth".to_string())]);
  assert_eq!(steps.load(Ordering::SeqCst), 4);

  pool.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_sentries_keep_results_apart() {
  setup_tracing_for_test();
  let executors = 4;
  let jobs_per_sentry = 25;
  let pool = WorkerPool::<String>::with_executors(
    "test_sentry_parallel",
    tokio::runtime::Handle::current(),
    executors,
  )
  .unwrap();

  let batches: Vec<_> = (0..executors)
    .map(|batch| {
      let pool = pool.clone();
      tokio::spawn(async move {
        let sentry = pool.sentry().expect("Pool is running.");
        for i in 0..jobs_per_sentry {
          sentry
            .guard(move || {
              let jitter_us = rand::rng().random_range(0..500u64);
              std::thread::sleep(Duration::from_micros(jitter_us));
              if i % 3 == 0 {
                Outcome::then(move || Outcome::done(format!("batch_{}_job_{}", batch, i)))
              } else {
                Outcome::done(format!("batch_{}_job_{}", batch, i))
              }
            })
            .await;
        }
        (batch, sentry.wait().await)
      })
    })
    .collect();

  let mut all_values = Vec::new();
  for handle in batches {
    let (batch, results) = timeout(WAIT_TIMEOUT, handle)
      .await
      .expect("Sentry batch hung.")
      .unwrap();
    assert_eq!(results.len(), jobs_per_sentry);

    let expected: Vec<Option<String>> = (0..jobs_per_sentry)
      .map(|i| Some(format!("batch_{}_job_{}", batch, i)))
      .collect();
    let got = sorted(results);
    assert_eq!(got, sorted(expected));
    all_values.extend(got);
  }
  assert_eq!(all_values.len(), executors * jobs_per_sentry);

  timeout(WAIT_TIMEOUT, pool.wait()).await.expect("Stop round hung.").unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_follow_completion_order() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::with_executors("test_sentry_order", tokio::runtime::Handle::current(), 2)
    .unwrap();

  let sentry = pool.sentry().unwrap();
  sentry
    .guard(|| {
      std::thread::sleep(Duration::from_millis(200));
      Outcome::done("slow".to_string())
    })
    .await;
  sentry.guard(|| Outcome::done("fast".to_string())).await;

  let results = timeout(WAIT_TIMEOUT, sentry.wait()).await.expect("Sentry wait hung.");
  assert_eq!(results, vec![Some("fast".to_string()), Some("slow".to_string())]);

  pool.wait().await.unwrap();
}

#[tokio::test]
async fn test_empty_and_panicking_jobs_record_none() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::with_executors("test_sentry_none", tokio::runtime::Handle::current(), 1)
    .unwrap();

  let sentry = pool.sentry().unwrap();
  sentry.guard(|| Outcome::<String>::Empty).await;
  sentry
    .guard(|| -> Outcome<String> { panic!("guarded job intentionally panicked") })
    .await;
  sentry
    .guard(|| Outcome::then(|| -> Outcome<String> { panic!("continuation intentionally panicked") }))
    .await;

  let results = timeout(WAIT_TIMEOUT, sentry.wait()).await.expect("Sentry wait hung.");
  assert_eq!(results, vec![None, None, None]);

  pool.wait().await.unwrap();
}

#[tokio::test]
async fn test_guard_on_stopped_pool_does_not_hang() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::with_executors("test_sentry_stopped", tokio::runtime::Handle::current(), 1)
    .unwrap();

  let sentry = pool.sentry().unwrap();
  sentry.guard(|| Outcome::done("ran".to_string())).await;
  pool.wait().await.unwrap();

  sentry.guard(|| Outcome::done("refused".to_string())).await;
  assert_eq!(sentry.outstanding(), 0);

  let results = timeout(WAIT_TIMEOUT, sentry.wait()).await.expect("Sentry wait hung.");
  assert_eq!(results, vec![Some("ran".to_string())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sentry_counters_track_progress() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::with_executors("test_sentry_counters", tokio::runtime::Handle::current(), 2)
    .unwrap();
  let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

  let sentry = pool.sentry().unwrap();
  sentry.guard(|| Outcome::done("quick".to_string())).await;
  sentry
    .guard(move || {
      let _ = release_rx.recv_timeout(Duration::from_secs(5));
      Outcome::done("held".to_string())
    })
    .await;

  sleep(Duration::from_millis(100)).await;
  assert_eq!(sentry.completed(), 1);
  assert_eq!(sentry.outstanding(), 1);

  release_tx.send(()).unwrap();
  let results = timeout(WAIT_TIMEOUT, sentry.wait()).await.expect("Sentry wait hung.");
  assert_eq!(results, vec![Some("quick".to_string()), Some("held".to_string())]);

  pool.wait().await.unwrap();
}

#[tokio::test]
async fn test_executors_run_jobs_concurrently() {
  setup_tracing_for_test();
  let pool = WorkerPool::<String>::with_executors("test_sentry_concurrent", tokio::runtime::Handle::current(), 2)
    .unwrap();
  let (signal_tx, signal_rx) = std::sync::mpsc::channel::<()>();
  let started = Instant::now();

  let sentry = pool.sentry().unwrap();
  sentry
    .guard(move || match signal_rx.recv_timeout(Duration::from_secs(2)) {
      Ok(()) => Outcome::done("received".to_string()),
      Err(_) => Outcome::done("timed_out".to_string()),
    })
    .await;
  sentry
    .guard(move || {
      let _ = signal_tx.send(());
      Outcome::done("sent".to_string())
    })
    .await;

  let results = timeout(WAIT_TIMEOUT, sentry.wait()).await.expect("Sentry wait hung.");
  assert_eq!(
    sorted(results),
    vec![Some("received".to_string()), Some("sent".to_string())]
  );
  assert!(
    started.elapsed() < Duration::from_secs(1),
    "Second executor should run while the first job is blocked."
  );

  pool.wait().await.unwrap();
}
