use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::trace;

/// Counting gate for concurrent sandbox workers.
#[derive(Debug)]
pub struct Limiter {
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

/// Held by a worker for as long as it runs. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    limiter: Arc<Limiter>,
}

impl Limiter {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { capacity: capacity.max(1), in_use: Mutex::new(0), freed: Condvar::new() })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        match self.in_use.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Waits for a free slot until `deadline`. `None` means the deadline
    /// passed first.
    pub fn acquire_until(self: &Arc<Self>, deadline: Instant) -> Option<Permit> {
        let mut guard = match self.in_use.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *guard >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                trace!(in_use = *guard, "sandbox admission deadline passed");
                return None;
            }
            guard = match self.freed.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *guard += 1;
        Some(Permit { limiter: Arc::clone(self) })
    }

    fn release(&self) {
        let mut guard = match self.in_use.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = guard.saturating_sub(1);
        self.freed.notify_one();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn admits_up_to_capacity() {
        let limiter = Limiter::new(2);
        let soon = Instant::now() + Duration::from_millis(20);
        let a = limiter.acquire_until(soon);
        let b = limiter.acquire_until(soon);
        assert!(a.is_some() && b.is_some());
        assert!(limiter.acquire_until(soon).is_none());
        assert_eq!(limiter.in_use(), 2);
        drop(a);
        assert_eq!(limiter.in_use(), 1);
        assert!(limiter.acquire_until(Instant::now() + Duration::from_millis(20)).is_some());
    }

    #[test]
    fn waiter_wakes_on_release() {
        let limiter = Limiter::new(1);
        let held = limiter.acquire_until(Instant::now()).unwrap();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            std::thread::spawn(move || {
                limiter.acquire_until(Instant::now() + Duration::from_secs(5)).is_some()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        assert_eq!(Limiter::new(0).capacity(), 1);
    }
}
