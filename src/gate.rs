//! Clone admission counters
//!
//! One `TaskGate` bounds concurrent clones process-wide; each reconciler
//! keeps a second one for its pool-local in-flight count. Acquisition is
//! a CAS bounded increment and the permit decrements on drop, so the
//! counter is released exactly once on every exit path, panics included,
//! and can never go negative.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct TaskGate {
    count: Arc<AtomicUsize>,
}

impl TaskGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot if fewer than `limit` are in flight.
    pub fn try_acquire(&self, limit: usize) -> Option<TaskPermit> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(TaskPermit { count: Arc::clone(&self.count) }),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Held for the duration of one clone attempt.
pub struct TaskPermit {
    count: Arc<AtomicUsize>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced() {
        let gate = TaskGate::new();
        let a = gate.try_acquire(2).unwrap();
        let _b = gate.try_acquire(2).unwrap();
        assert!(gate.try_acquire(2).is_none());
        assert_eq!(gate.in_flight(), 2);

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire(2).is_some());
    }

    #[test]
    fn test_zero_limit_admits_nothing() {
        let gate = TaskGate::new();
        assert!(gate.try_acquire(0).is_none());
    }

    #[test]
    fn test_never_negative_under_contention() {
        let gate = Arc::new(TaskGate::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(permit) = gate.try_acquire(3) {
                        assert!(gate.in_flight() <= 3);
                        drop(permit);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_released_on_panic() {
        let gate = Arc::new(TaskGate::new());
        let cloned = Arc::clone(&gate);
        let result = std::thread::spawn(move || {
            let _permit = cloned.try_acquire(1).unwrap();
            panic!("clone blew up");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(gate.in_flight(), 0);
    }
}
