use crate::countdown::Countdown;
use crate::job::{BoxedJob, Outcome};

use std::fmt;
use std::sync::Arc;

/// The sentinel of one shutdown round, shared by every executor of the round.
///
/// Its countdown starts at the executor count; each executor's chase task
/// lowers it once after the executor has taken the token and stopped.
#[derive(Debug)]
pub(crate) struct StopToken {
  round: u64,
  countdown: Countdown,
}

impl StopToken {
  pub(crate) fn new(round: u64, executors: usize) -> Self {
    Self {
      round,
      countdown: Countdown::new(executors),
    }
  }

  pub(crate) fn round(&self) -> u64 {
    self.round
  }

  pub(crate) fn countdown(&self) -> &Countdown {
    &self.countdown
  }

  /// Running the token does nothing.
  pub(crate) fn execute<R>(&self) -> Outcome<R> {
    Outcome::Empty
  }
}

/// A message on a pool's inbound queue.
pub(crate) enum Dispatch<R> {
  Run { job_id: u64, job: BoxedJob<R> },
  Stop(Arc<StopToken>),
}

impl<R> fmt::Debug for Dispatch<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Dispatch::Run { job_id, .. } => f
        .debug_struct("Run")
        .field("job_id", job_id)
        .finish_non_exhaustive(),
      Dispatch::Stop(token) => f.debug_tuple("Stop").field(&token.round()).finish(),
    }
  }
}
