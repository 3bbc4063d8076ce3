use thiserror::Error;

/// Lifecycle misuse errors reported by a `WorkerPool`.
///
/// Job-level failures never show up here; a job encodes its own failure in the
/// value it produces.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
  #[error("pool is busy on jobs")]
  BusyOnJobs,

  #[error("pool is busy on job results")]
  BusyOnJobResults,

  #[error("pool is free")]
  Idle,

  /// Never returned: the inbound queue and the relay are created and torn
  /// down together, and a settling round reports `AlreadyDraining` first.
  /// Kept so the failure names of the stop operation stay complete.
  #[error("pool has no job results")]
  NoJobResults,

  #[error("pool is already draining")]
  AlreadyDraining,

  #[error("pool needs at least one executor")]
  NoExecutors,
}
