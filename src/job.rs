use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, trace};

/// A unit of work run by the pool.
///
/// A job is consumed when it runs. Any `FnOnce() -> Outcome<R>` closure that
/// is `Send + 'static` is a job.
pub trait Job<R>: Send + 'static {
  fn execute(self: Box<Self>) -> Outcome<R>;
}

/// The form in which jobs travel through queues and continuations.
pub type BoxedJob<R> = Box<dyn Job<R>>;

impl<R, F> Job<R> for F
where
  F: FnOnce() -> Outcome<R> + Send + 'static,
{
  fn execute(self: Box<Self>) -> Outcome<R> {
    (*self)()
  }
}

/// What executing a job produced.
pub enum Outcome<R> {
  /// Nothing worth recording.
  Empty,
  /// A resolved value.
  Final(R),
  /// More work: run this job next and use its outcome instead.
  Continue(BoxedJob<R>),
}

impl<R> Outcome<R> {
  pub fn done(value: R) -> Self {
    Outcome::Final(value)
  }

  /// Wraps `job` as a continuation.
  pub fn then<J: Job<R>>(job: J) -> Self {
    Outcome::Continue(Box::new(job))
  }

  pub fn is_continue(&self) -> bool {
    matches!(self, Outcome::Continue(_))
  }

  pub fn is_final(&self) -> bool {
    matches!(self, Outcome::Final(_))
  }

  /// Returns the resolved value, if any.
  ///
  /// An unresolved continuation yields `None`; run it through [`chase`] first.
  pub fn into_value(self) -> Option<R> {
    match self {
      Outcome::Final(value) => Some(value),
      Outcome::Empty | Outcome::Continue(_) => None,
    }
  }
}

impl<R: fmt::Debug> fmt::Debug for Outcome<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Outcome::Empty => f.write_str("Empty"),
      Outcome::Final(value) => f.debug_tuple("Final").field(value).finish(),
      Outcome::Continue(_) => f.write_str("Continue(..)"),
    }
  }
}

/// Runs continuations until the outcome is `Empty` or `Final`.
///
/// Iterative, so chain length does not grow the stack. Chasing an outcome that
/// is already resolved returns it unchanged. A step that panics ends the chain
/// with `Outcome::Empty`.
pub fn chase<R: 'static>(mut outcome: Outcome<R>) -> Outcome<R> {
  let mut depth = 0usize;
  while let Outcome::Continue(job) = outcome {
    depth += 1;
    outcome = run_job(job);
  }
  if depth > 0 {
    trace!(depth, "Continuation chain resolved.");
  }
  outcome
}

/// Executes a single job, containing any panic it raises.
pub(crate) fn run_job<R: 'static>(job: BoxedJob<R>) -> Outcome<R> {
  match panic::catch_unwind(AssertUnwindSafe(move || job.execute())) {
    Ok(outcome) => outcome,
    Err(_panic_payload) => {
      error!("Job panicked during execution. Treating its outcome as empty.");
      Outcome::Empty
    }
  }
}
