use std::sync::{Mutex, MutexGuard};

use tracing::warn;

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "cached layer payloads may be stale after a panic in another thread",
                "Recovered from poisoned memory tier lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{AssertUnwindSafe, catch_unwind},
        sync::Mutex,
    };

    use super::*;

    #[test]
    fn recovers_after_poisoning() {
        let lock = Mutex::new(1usize);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().unwrap();
            panic!("poison the lock");
        }));
        assert!(lock.is_poisoned());

        *mutex_lock(&lock, "cache::lock", "test") += 1;
        assert_eq!(*mutex_lock(&lock, "cache::lock", "test"), 2);
    }
}
