/* Poison-tolerant locking. A reader thread that panics while delivering events must not
 * take the whole registry down with it; the protected data stays structurally valid. */
use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
