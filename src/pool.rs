use crate::dispatch::{Dispatch, StopToken};
use crate::error::PoolError;
use crate::job::{chase, run_job, BoxedJob, Job, Outcome};
use crate::sentry::Sentry;

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, trace_span, warn, Instrument};

static NEXT_JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Slots in the inbound queue. A submitter waits once a job is already parked
/// there and no executor has taken it.
const INBOUND_CAPACITY: usize = 1;

/// Lifecycle state of a pool. Both lanes are `Some` exactly while running.
struct PoolState<R: Send + 'static> {
  inbound: Option<kanal::AsyncSender<Dispatch<R>>>,
  /// Owns the chase tasks spawned by executors.
  relay: Option<TaskTracker>,
  executors: Vec<JoinHandle<()>>,
  draining: bool,
}

impl<R: Send + 'static> PoolState<R> {
  fn idle() -> Self {
    Self {
      inbound: None,
      relay: None,
      executors: Vec::new(),
      draining: false,
    }
  }
}

/// A fixed-size pool of executors consuming jobs from a shared queue.
///
/// A pool starts idle. [`spawn`](WorkerPool::spawn) starts `n` executors and
/// [`wait`](WorkerPool::wait) runs a graceful stop round that returns the pool
/// to idle, after which it can be spawned again.
///
/// Each executor runs a job to completion, then hands the outcome to a fresh
/// chase task and immediately goes back to the queue. The chase task resolves
/// any continuation chain, so a long chain never holds up an executor.
///
/// Job bodies and chases run on Tokio's blocking pool, so a slow or stuck job
/// only holds its own executor.
pub struct WorkerPool<R: Send + 'static> {
  pool_name: Arc<String>,
  tokio_handle: TokioHandle,
  state: Arc<Mutex<PoolState<R>>>,
  active_jobs: Arc<DashMap<u64, usize>>,
  stop_rounds: AtomicU64,
}

impl<R: Send + 'static> WorkerPool<R> {
  /// Creates an idle pool whose tasks will run on `tokio_handle`.
  pub fn new(pool_name: &str, tokio_handle: TokioHandle) -> Arc<Self> {
    Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      tokio_handle,
      state: Arc::new(Mutex::new(PoolState::idle())),
      active_jobs: Arc::new(DashMap::new()),
      stop_rounds: AtomicU64::new(0),
    })
  }

  /// Creates a pool and spawns `executors` executors on it.
  pub fn with_executors(
    pool_name: &str,
    tokio_handle: TokioHandle,
    executors: usize,
  ) -> Result<Arc<Self>, PoolError> {
    let pool = Self::new(pool_name, tokio_handle);
    pool.spawn(executors)?;
    Ok(pool)
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Returns `true` from a successful `spawn` until a stop round closes the inbound queue.
  pub fn is_running(&self) -> bool {
    self.state.lock().inbound.is_some()
  }

  pub fn executor_count(&self) -> usize {
    self.state.lock().executors.len()
  }

  /// Number of jobs currently executing on an executor.
  pub fn active_job_count(&self) -> usize {
    self.active_jobs.len()
  }

  /// Number of chase tasks that have not finished yet.
  pub fn pending_chase_count(&self) -> usize {
    self.state.lock().relay.as_ref().map_or(0, TaskTracker::len)
  }

  pub(crate) fn is_accepting(&self) -> bool {
    let state = self.state.lock();
    state.inbound.is_some() && !state.draining
  }

  /// Starts `executors` executor tasks.
  ///
  /// # Errors
  /// `PoolError::BusyOnJobs` if the pool is already running,
  /// `PoolError::BusyOnJobResults` if a stop round is still settling chase tasks,
  /// `PoolError::NoExecutors` if `executors` is zero.
  pub fn spawn(&self, executors: usize) -> Result<(), PoolError> {
    if executors == 0 {
      return Err(PoolError::NoExecutors);
    }

    let mut state = self.state.lock();
    if state.inbound.is_some() {
      warn!(pool_name = %self.pool_name, "Spawn: pool is already running.");
      return Err(PoolError::BusyOnJobs);
    }
    if state.relay.is_some() {
      warn!(pool_name = %self.pool_name, "Spawn: previous stop round is still resolving job results.");
      return Err(PoolError::BusyOnJobResults);
    }

    let (inbound_tx, inbound_rx) = kanal::bounded_async::<Dispatch<R>>(INBOUND_CAPACITY);
    let relay = TaskTracker::new();

    let handles: Vec<JoinHandle<()>> = (0..executors)
      .map(|executor| {
        let loop_future = Self::run_executor_loop(
          self.pool_name.clone(),
          executor,
          inbound_rx.clone(),
          relay.clone(),
          self.tokio_handle.clone(),
          self.active_jobs.clone(),
        );
        self.tokio_handle.spawn(loop_future.instrument(info_span!(
          "pool_executor",
          pool_name = %self.pool_name,
          executor
        )))
      })
      .collect();

    state.inbound = Some(inbound_tx);
    state.relay = Some(relay);
    state.executors = handles;
    state.draining = false;

    info!(pool_name = %self.pool_name, executors, "Pool spawned.");
    Ok(())
  }

  /// Queues `job` for execution.
  ///
  /// Waits while the inbound slot is occupied. If the pool is idle or draining
  /// the job is dropped without an error.
  pub async fn submit<J: Job<R>>(&self, job: J) {
    let _ = self.dispatch(Box::new(job)).await;
  }

  /// Sends a job to the executors, reporting why it was refused.
  pub(crate) async fn dispatch(&self, job: BoxedJob<R>) -> Result<(), PoolError> {
    let inbound = {
      let state = self.state.lock();
      match (&state.inbound, state.draining) {
        (Some(inbound), false) => inbound.clone(),
        (Some(_), true) => {
          warn!(pool_name = %self.pool_name, "Submit: pool is draining. Job dropped.");
          return Err(PoolError::AlreadyDraining);
        }
        (None, _) => {
          warn!(pool_name = %self.pool_name, "Submit: pool is idle. Job dropped.");
          return Err(PoolError::Idle);
        }
      }
    };

    let job_id = NEXT_JOB_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    debug!(pool_name = %self.pool_name, %job_id, "Submitting job to inbound queue.");

    match inbound.send(Dispatch::Run { job_id, job }).await {
      Ok(()) => Ok(()),
      Err(send_error) => {
        warn!(
          pool_name = %self.pool_name,
          %job_id,
          "Submit: inbound queue closed before the job was taken. Job dropped. {:?}",
          send_error
        );
        Err(PoolError::Idle)
      }
    }
  }

  /// Returns a new sentry bound to this pool, or `None` if the pool is not running.
  pub fn sentry(self: &Arc<Self>) -> Option<Sentry<R>> {
    Sentry::new(self)
  }

  /// Gracefully stops every executor and returns the pool to idle.
  ///
  /// One stop token per executor is queued behind any submitted jobs. Once
  /// every executor has taken its token, the inbound queue is closed and the
  /// call waits for all outstanding chase tasks, so every continuation started
  /// before the stop has resolved when this returns.
  ///
  /// The round runs as its own task. Dropping the returned future does not
  /// abandon it; the pool still reaches idle.
  ///
  /// # Errors
  /// `PoolError::Idle` if the pool is not running,
  /// `PoolError::AlreadyDraining` if another stop round is in progress.
  pub async fn wait(&self) -> Result<(), PoolError> {
    let (inbound, executors) = {
      let mut state = self.state.lock();
      if state.draining {
        return Err(PoolError::AlreadyDraining);
      }
      let inbound = state.inbound.clone().ok_or(PoolError::Idle)?;
      if state.relay.is_none() {
        return Err(PoolError::NoJobResults);
      }
      state.draining = true;
      (inbound, state.executors.len())
    };

    let round = self.stop_rounds.fetch_add(1, AtomicOrdering::Relaxed) + 1;
    // Detached, so dropping this future never strands the pool mid-round.
    let round_handle = self.tokio_handle.spawn(
      Self::run_stop_round(self.pool_name.clone(), self.state.clone(), inbound, executors, round)
        .instrument(info_span!("stop_round", pool_name = %self.pool_name, round)),
    );

    if let Err(join_error) = round_handle.await {
      error!(pool_name = %self.pool_name, round, "Stop round failed to join: {:?}", join_error);
      let mut state = self.state.lock();
      if let Some(inbound) = state.inbound.take() {
        let _ = inbound.close();
      }
      if let Some(relay) = state.relay.take() {
        relay.close();
      }
      state.executors.clear();
      state.draining = false;
    }
    Ok(())
  }

  async fn run_stop_round(
    pool_name: Arc<String>,
    state: Arc<Mutex<PoolState<R>>>,
    inbound: kanal::AsyncSender<Dispatch<R>>,
    executors: usize,
    round: u64,
  ) {
    let token = Arc::new(StopToken::new(round, executors));
    info!(pool_name = %pool_name, round, executors, "Stop round started. Draining executors.");

    for _ in 0..executors {
      if let Err(send_error) = inbound.send(Dispatch::Stop(token.clone())).await {
        // No executor will take this token, so account for it here.
        error!(pool_name = %pool_name, round, "Stop token could not be queued: {:?}", send_error);
        token.countdown().count_down();
      }
    }
    token.countdown().wait().await;
    debug!(pool_name = %pool_name, round, "Every executor took its stop token.");

    let (relay, handles) = {
      let mut state = state.lock();
      if let Some(inbound) = state.inbound.take() {
        let _ = inbound.close();
      }
      (state.relay.clone(), std::mem::take(&mut state.executors))
    };
    drop(inbound);

    if let Some(relay) = relay {
      relay.close();
      trace!(pool_name = %pool_name, pending = relay.len(), "Waiting for chase tasks.");
      relay.wait().await;
    }

    for joined in join_all(handles).await {
      if let Err(join_error) = joined {
        error!(pool_name = %pool_name, "Executor task failed to join: {:?}", join_error);
      }
    }

    {
      let mut state = state.lock();
      state.relay = None;
      state.draining = false;
    }
    info!(pool_name = %pool_name, round, "Stop round completed. Pool is idle.");
  }

  /// Stops the pool.
  ///
  /// This is the same drain as [`wait`](WorkerPool::wait): jobs already queued
  /// or executing run to completion. Interrupting in-flight work is not
  /// supported.
  pub async fn stop(&self) -> Result<(), PoolError> {
    self.wait().await
  }

  async fn run_executor_loop(
    pool_name: Arc<String>,
    executor: usize,
    inbound: kanal::AsyncReceiver<Dispatch<R>>,
    relay: TaskTracker,
    tokio_handle: TokioHandle,
    active_jobs: Arc<DashMap<u64, usize>>,
  ) {
    debug!(name = %*pool_name, executor, "Executor started.");

    loop {
      let dispatch = match inbound.recv().await {
        Ok(dispatch) => dispatch,
        Err(_) => {
          info!(name = %*pool_name, executor, "Inbound queue closed. Executor exiting.");
          break;
        }
      };

      let (job_id, outcome, stop) = match dispatch {
        Dispatch::Run { job_id, job } => {
          active_jobs.insert(job_id, executor);
          trace!(name = %*pool_name, executor, %job_id, "Executing job.");
          let outcome = match tokio_handle.spawn_blocking(move || run_job(job)).await {
            Ok(outcome) => outcome,
            Err(join_error) => {
              error!(name = %*pool_name, executor, %job_id, "Job failed to join: {:?}", join_error);
              Outcome::Empty
            }
          };
          active_jobs.remove(&job_id);
          (Some(job_id), outcome, None)
        }
        Dispatch::Stop(token) => {
          debug!(name = %*pool_name, executor, round = token.round(), "Stop token taken.");
          (None, token.execute(), Some(token))
        }
      };

      let stopping = stop.is_some();
      // The outcome moves into its own chase task; no other job can observe it.
      let chase_span = trace_span!("chase", pool_name = %*pool_name, executor, job_id = ?job_id);
      relay.spawn_blocking_on(
        move || chase_span.in_scope(|| Self::run_chase(outcome, stop)),
        &tokio_handle,
      );

      if stopping {
        break;
      }
    }

    debug!(name = %*pool_name, executor, "Executor stopped.");
  }

  fn run_chase(outcome: Outcome<R>, stop: Option<Arc<StopToken>>) {
    let resolved = chase(outcome);
    trace!(final_is_value = resolved.is_final(), "Chase finished.");
    if let Some(token) = stop {
      token.countdown().count_down();
    }
  }
}

impl<R: Send + 'static> Drop for WorkerPool<R> {
  fn drop(&mut self) {
    let mut state = self.state.lock();
    if let Some(inbound) = state.inbound.take() {
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool dropped while running. Closing inbound queue so executors exit."
      );
      let _ = inbound.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: pool already idle.");
    }
    if let Some(relay) = state.relay.take() {
      relay.close();
    }
  }
}
