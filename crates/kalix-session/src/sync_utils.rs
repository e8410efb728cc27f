use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, taking the guard back from a poisoned lock.
pub fn lock_or_recover<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
