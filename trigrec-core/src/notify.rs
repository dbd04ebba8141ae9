//! Producer → consumer wakeup.
//!
//! The real-time side only sets a flag and signals the condition variable; it
//! never takes a lock. The consumer waits on the condition variable with the
//! mutex guarding its own bookkeeping state (never the ring buffer). A signal
//! that races the consumer's check is caught by the wait timeout, so the ring
//! buffer is always polled at least once per timeout.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Condvar, MutexGuard};

/// Upper bound on how long a consumer sleeps without being signalled.
pub const WAKE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Signal {
    pending: AtomicBool,
    cond: Condvar,
}

/// Cloneable handle to a data-ready signal.
#[derive(Debug, Clone, Default)]
pub struct DataReady {
    signal: Arc<Signal>,
}

impl DataReady {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce that a period was published. Lock-free; safe to call from the
    /// audio callback.
    pub fn notify(&self) {
        self.signal.pending.store(true, Ordering::Release);
        self.signal.cond.notify_one();
    }

    /// Sleep until notified or `timeout` elapses, unless a notification is
    /// already pending. Returns whether a notification was consumed.
    ///
    /// Every caller must pass guards of the same mutex.
    pub fn wait_for<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        if self.signal.pending.swap(false, Ordering::AcqRel) {
            return true;
        }
        self.signal.cond.wait_for(guard, timeout);
        self.signal.pending.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[test]
    fn pending_notification_returns_immediately() {
        let ready = DataReady::new();
        let lock = Mutex::new(());
        ready.notify();

        let started = Instant::now();
        let mut guard = lock.lock();
        assert!(ready.wait_for(&mut guard, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out_without_notification() {
        let ready = DataReady::new();
        let lock = Mutex::new(());
        let mut guard = lock.lock();
        assert!(!ready.wait_for(&mut guard, Duration::from_millis(5)));
    }

    #[test]
    fn notify_from_another_thread_wakes_waiter() {
        let ready = DataReady::new();
        let notifier = ready.clone();
        let lock = Mutex::new(());

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            notifier.notify();
        });

        let mut guard = lock.lock();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ready.wait_for(&mut guard, WAKE_TIMEOUT) {
            assert!(Instant::now() < deadline, "never woken");
        }
        drop(guard);
        handle.join().expect("notifier thread panicked");
    }
}
