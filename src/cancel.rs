//! Cooperative cancellation for long-running operations.
//!
//! Loads, dumps and growth-triggering puts poll a [`CancelToken`] once per
//! record. Work already written stays written; nothing is rolled back.

use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A cloneable cancellation flag with an optional deadline.
///
/// Clones share the flag, so one thread can cancel work running on another.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  flag: Arc<AtomicBool>,
  deadline: Option<Instant>,
  /// Checks left before the token cancels itself.
  #[cfg(test)]
  budget: Option<Arc<AtomicUsize>>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// A token that is only cancelled explicitly.
  pub fn never() -> Self {
    Self::default()
  }

  /// A token that also cancels itself once `timeout` has elapsed.
  pub fn with_timeout(timeout: Duration) -> Self {
    Self {
      deadline: Instant::now().checked_add(timeout),
      ..Self::default()
    }
  }

  /// A token that passes `checks` calls to `check` and cancels on the next.
  #[cfg(test)]
  pub(crate) fn after_checks(checks: usize) -> Self {
    Self {
      budget: Some(Arc::new(AtomicUsize::new(checks))),
      ..Self::default()
    }
  }

  pub fn cancel(&self) {
    self.flag.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    if self.flag.load(Ordering::Acquire) {
      return true;
    }
    self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
  }

  /// Returns `Error::Cancelled` once the token has been cancelled or has expired.
  #[inline]
  pub fn check(&self) -> Result<()> {
    #[cfg(test)]
    if let Some(budget) = &self.budget {
      if budget.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)).is_err() {
        self.cancel();
      }
    }
    if self.is_cancelled() {
      return Err(Error::Cancelled);
    }
    Ok(())
  }
}
