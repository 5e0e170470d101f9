//! Helpers for threads that live outside the engine.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Blocks a thread until `n` callbacks have called [`WaitGroup::done`].
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let wg = Arc::new(skein::WaitGroup::new(1));
/// let done = wg.clone();
/// skein::create_timer_task(Duration::from_millis(10), move |_| done.done()).start();
/// wg.wait();
/// ```
#[derive(Debug)]
pub struct WaitGroup {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl WaitGroup {
    pub fn new(n: usize) -> Self {
        Self {
            remaining: Mutex::new(n),
            zero: Condvar::new(),
        }
    }

    /// Extra calls past zero are ignored.
    pub fn done(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return;
        }

        *remaining -= 1;
        if *remaining == 0 {
            self.zero.notify_all();
        }
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }

    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.zero.wait(&mut remaining);
        }
    }

    /// Returns `false` if the count was not zero by the time `timeout`
    /// elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut remaining = self.remaining.lock();

        while *remaining > 0 {
            if self.zero.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }

        true
    }
}
