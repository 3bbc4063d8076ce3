use crate::countdown::Countdown;
use crate::job::{chase, run_job, BoxedJob, Job, Outcome};
use crate::pool::WorkerPool;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

static NEXT_SENTRY_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// State shared between a sentry and the guarded jobs in flight for it.
struct SentryShared<R> {
  sentry_id: u64,
  results: Mutex<Vec<Option<R>>>,
  outstanding: Countdown,
}

impl<R> SentryShared<R> {
  fn record(&self, value: Option<R>) {
    let completed = {
      let mut results = self.results.lock();
      results.push(value);
      results.len()
    };
    self.outstanding.count_down();
    trace!(sentry_id = self.sentry_id, completed, "Guarded job recorded.");
  }
}

/// A barrier over one batch of jobs run through a [`WorkerPool`].
///
/// Every job passed to [`guard`](Sentry::guard) is run by the pool as usual,
/// its continuation chain is chased, and the final value is appended to the
/// sentry. [`wait`](Sentry::wait) resolves once every guarded job has been
/// recorded and returns the values in the order they completed, which is not
/// necessarily the order they were guarded. A job that ends without a value
/// (`Outcome::Empty`, or a panic) is recorded as `None`.
///
/// Several sentries may share one pool; each keeps its own count and results.
pub struct Sentry<R: Send + 'static> {
  pool: Arc<WorkerPool<R>>,
  shared: Arc<SentryShared<R>>,
}

impl<R: Send + 'static> Sentry<R> {
  /// Returns `None` if `pool` is idle or draining.
  pub fn new(pool: &Arc<WorkerPool<R>>) -> Option<Self> {
    if !pool.is_accepting() {
      debug!(pool_name = %pool.name(), "Sentry not created: pool is not running.");
      return None;
    }
    let sentry_id = NEXT_SENTRY_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    debug!(pool_name = %pool.name(), sentry_id, "Sentry created.");
    Some(Self {
      pool: pool.clone(),
      shared: Arc::new(SentryShared {
        sentry_id,
        results: Mutex::new(Vec::new()),
        outstanding: Countdown::default(),
      }),
    })
  }

  pub fn id(&self) -> u64 {
    self.shared.sentry_id
  }

  /// Guarded jobs not yet recorded.
  pub fn outstanding(&self) -> usize {
    self.shared.outstanding.count()
  }

  /// Guarded jobs recorded so far.
  pub fn completed(&self) -> usize {
    self.shared.results.lock().len()
  }

  /// Submits `job` to the pool under this sentry.
  ///
  /// Waits for room in the pool's inbound queue like
  /// [`WorkerPool::submit`]. If the pool refuses the job it is dropped and
  /// no longer counted, so [`wait`](Sentry::wait) does not wait for it.
  pub async fn guard<J: Job<R>>(&self, job: J) {
    self.shared.outstanding.add(1);
    let guard = Guard {
      shared: Some(self.shared.clone()),
      job: Some(Box::new(job)),
    };
    if let Err(refused) = self.pool.dispatch(Box::new(guard)).await {
      warn!(sentry_id = self.shared.sentry_id, %refused, "Guarded job refused by the pool.");
    }
  }

  /// Waits for every guarded job and returns their values in completion order.
  pub async fn wait(self) -> Vec<Option<R>> {
    self.shared.outstanding.wait().await;
    let results = std::mem::take(&mut *self.shared.results.lock());
    debug!(sentry_id = self.shared.sentry_id, recorded = results.len(), "Sentry released.");
    results
  }
}

impl<R: Send + 'static> fmt::Debug for Sentry<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Sentry")
      .field("sentry_id", &self.shared.sentry_id)
      .field("pool_name", &self.pool.name())
      .field("outstanding", &self.outstanding())
      .field("completed", &self.completed())
      .finish()
  }
}

/// Wraps a caller's job. Its outcome is an [`Unguard`] carrying the raw result.
///
/// Dropped without running (the pool closed before an executor took it), it
/// releases its slot in the sentry count.
struct Guard<R> {
  shared: Option<Arc<SentryShared<R>>>,
  job: Option<BoxedJob<R>>,
}

impl<R: Send + 'static> Job<R> for Guard<R> {
  fn execute(mut self: Box<Self>) -> Outcome<R> {
    let Some(shared) = self.shared.take() else {
      return Outcome::Empty;
    };
    let raw = self.job.take().map_or(Outcome::Empty, run_job);
    Outcome::then(Unguard {
      shared: Some(shared),
      raw: Some(raw),
    })
  }
}

impl<R> Drop for Guard<R> {
  fn drop(&mut self) {
    if let Some(shared) = self.shared.take() {
      warn!(sentry_id = shared.sentry_id, "Guarded job dropped before it ran.");
      shared.outstanding.count_down();
    }
  }
}

/// Chases a guarded job's raw outcome and records the final value.
///
/// The value moves into the sentry, so the outcome seen by the pool is empty.
struct Unguard<R> {
  shared: Option<Arc<SentryShared<R>>>,
  raw: Option<Outcome<R>>,
}

impl<R: Send + 'static> Job<R> for Unguard<R> {
  fn execute(mut self: Box<Self>) -> Outcome<R> {
    let Some(shared) = self.shared.take() else {
      return Outcome::Empty;
    };
    let resolved = chase(self.raw.take().unwrap_or(Outcome::Empty));
    shared.record(resolved.into_value());
    Outcome::Empty
  }
}

impl<R> Drop for Unguard<R> {
  fn drop(&mut self) {
    if let Some(shared) = self.shared.take() {
      warn!(sentry_id = shared.sentry_id, "Guarded result dropped before it was recorded.");
      shared.outstanding.count_down();
    }
  }
}
