//! Single-fire signal with bounded waits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Fires once; waiters block until it fires or their timeout elapses.
///
/// Clones share the same signal, so one clone can live on the watcher
/// thread while another is awaited by the caller.
#[derive(Debug, Clone, Default)]
pub struct CaptureLatch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CaptureLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the latch. Later calls are no-ops.
    pub fn signal(&self) {
        let (fired, condvar) = &*self.inner;
        let mut fired = fired.lock();
        if !*fired {
            *fired = true;
            condvar.notify_all();
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the latch fires or `timeout` elapses.
    ///
    /// Returns whether the latch had fired. Timing out is not an error.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (fired, condvar) = &*self.inner;
        let mut fired = fired.lock();
        while !*fired {
            if condvar.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_is_idempotent() {
        let latch = CaptureLatch::new();
        latch.signal();
        latch.signal();
        assert!(latch.is_signaled());
        assert!(latch.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_wait_returns_after_timeout_without_signal() {
        let latch = CaptureLatch::new();
        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        assert!(!latch.wait_timeout(timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1), "waited {:?}", elapsed);
    }

    #[test]
    fn test_signal_from_other_thread_wakes_waiter() {
        let latch = CaptureLatch::new();
        let remote = latch.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.signal();
        });
        let start = Instant::now();
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
