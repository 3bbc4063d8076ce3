use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tracing::warn;

/// An async counting barrier.
///
/// The count is raised with [`add`](Countdown::add) and lowered with
/// [`count_down`](Countdown::count_down); [`wait`](Countdown::wait) resolves
/// once it is zero. The count never goes below zero.
pub struct Countdown {
  count: AtomicUsize,
  zero: Notify,
}

impl Countdown {
  pub fn new(initial: usize) -> Self {
    Self {
      count: AtomicUsize::new(initial),
      zero: Notify::new(),
    }
  }

  pub fn add(&self, n: usize) {
    self.count.fetch_add(n, Ordering::AcqRel);
  }

  /// Lowers the count by one and wakes all waiters when it reaches zero.
  ///
  /// Returns `false` without touching the count if it was already zero.
  pub fn count_down(&self) -> bool {
    match self
      .count
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(1))
    {
      Ok(previous) => {
        if previous == 1 {
          self.zero.notify_waiters();
        }
        true
      }
      Err(_) => {
        warn!("Countdown: count_down called on a zero count. Ignored.");
        false
      }
    }
  }

  pub fn count(&self) -> usize {
    self.count.load(Ordering::Acquire)
  }

  /// Resolves once the count is zero.
  pub async fn wait(&self) {
    loop {
      let notified = self.zero.notified();
      tokio::pin!(notified);
      // Register before checking so a concurrent final count_down is not missed.
      notified.as_mut().enable();
      if self.count() == 0 {
        return;
      }
      notified.await;
    }
  }
}

impl Default for Countdown {
  fn default() -> Self {
    Self::new(0)
  }
}

impl fmt::Debug for Countdown {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Countdown").field("count", &self.count()).finish()
  }
}
