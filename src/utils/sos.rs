use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Signal of stop: a one-shot flag shared between threads that can also be
/// waited on with a deadline.
#[derive(Debug)]
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Release);

        // Lock briefly so a waiter between its check and its wait cannot miss the notify
        let _guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Blocks until cancelled or until `timeout` elapses.
    /// Returns `true` if the signal was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.shared.condvar.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Sleeps for `duration` unless cancelled first.
    /// Returns `true` if the sleep was interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.wait_timeout(duration)
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SignalOfStop {
    fn clone(&self) -> SignalOfStop {
        SignalOfStop {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let sos = SignalOfStop::new();
        let started = Instant::now();
        assert!(!sos.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let sos = SignalOfStop::new();
        let remote = sos.clone();
        let waiter = thread::spawn(move || remote.wait_timeout(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        sos.cancel();

        assert!(waiter.join().unwrap());
        assert!(sos.cancelled());
    }
}
