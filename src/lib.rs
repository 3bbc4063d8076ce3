//! A Tokio-based pool of executors that run opaque jobs, chase their
//! continuation chains off the dispatch path, and drain gracefully.
//! Sentries layer batch barriers on top of a pool.

mod countdown;
mod dispatch;
mod error;
mod job;
mod pool;
mod sentry;

pub use countdown::Countdown;
pub use error::PoolError;
pub use job::{chase, BoxedJob, Job, Outcome};
pub use pool::WorkerPool;
pub use sentry::Sentry;
