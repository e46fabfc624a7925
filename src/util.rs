use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, absorbing poisoning: a handler thread that panicked must
/// not take the node down with it.
pub fn lock_then_release<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
