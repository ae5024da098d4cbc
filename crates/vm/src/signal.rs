//! Signal delivery queue.
//!
//! Producers (an OS signal handler, another thread) enqueue by bumping
//! a per-signal pending counter and the total count; nothing here takes
//! a lock. The VM drains at safepoints while holding the GVL, invoking
//! the registered trap handler or raising the corresponding guest
//! error. Signals always land on the main thread's queue.

use std::sync::atomic::{AtomicU32, Ordering};

/// Highest signal number tracked, exclusive.
pub const SIGNAL_MAX: usize = 64;

/// Lock-free pending-signal counters.
pub struct SignalRing {
    pending: [AtomicU32; SIGNAL_MAX],
    total: AtomicU32,
}

impl Default for SignalRing {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRing {
    pub fn new() -> Self {
        Self {
            pending: std::array::from_fn(|_| AtomicU32::new(0)),
            total: AtomicU32::new(0),
        }
    }

    /// Enqueues one delivery of `signo`. Safe from any thread and from
    /// signal-handler context.
    pub fn enqueue(&self, signo: i32) {
        if !(0..SIGNAL_MAX as i32).contains(&signo) {
            return;
        }
        self.pending[signo as usize].fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// True when any signal is pending.
    pub fn any_pending(&self) -> bool {
        self.total.load(Ordering::SeqCst) > 0
    }

    /// Dequeues one pending signal, lowest number first.
    pub fn drain_one(&self) -> Option<i32> {
        if !self.any_pending() {
            return None;
        }
        for signo in 0..SIGNAL_MAX {
            let slot = &self.pending[signo];
            let mut current = slot.load(Ordering::SeqCst);
            while current > 0 {
                match slot.compare_exchange(
                    current,
                    current - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        self.total.fetch_sub(1, Ordering::SeqCst);
                        return Some(signo as i32);
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_drain_order() {
        let ring = SignalRing::new();
        assert!(!ring.any_pending());
        assert_eq!(ring.drain_one(), None);

        ring.enqueue(15);
        ring.enqueue(2);
        ring.enqueue(2);
        assert!(ring.any_pending());

        assert_eq!(ring.drain_one(), Some(2));
        assert_eq!(ring.drain_one(), Some(2));
        assert_eq!(ring.drain_one(), Some(15));
        assert_eq!(ring.drain_one(), None);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let ring = SignalRing::new();
        ring.enqueue(-1);
        ring.enqueue(SIGNAL_MAX as i32);
        assert!(!ring.any_pending());
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;
        let ring = Arc::new(SignalRing::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    ring.enqueue(10);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut drained = 0;
        while ring.drain_one().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 4000);
    }
}
