//! Small shared helpers: budgeted mutex acquisition and wall-clock access.

use crate::error::Error;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Acquires `mutex` within `budget`, or fails `LockBudget`.
///
/// Critical sections in this crate are microseconds long, so the first
/// attempt succeeds in practice; the bounded retry loop exists so a stuck
/// holder degrades into a logged skip instead of a blocked task.
pub fn lock_with_budget<'a, T>(
    mutex: &'a Mutex<T>,
    budget: Duration,
    what: &'static str,
) -> Result<MutexGuard<'a, T>, Error> {
    let deadline = Instant::now() + budget;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                // A panicking holder cannot leave a partially-updated
                // numeric state here; keep serving.
                return Ok(poisoned.into_inner());
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return Err(Error::LockBudget(what));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}
