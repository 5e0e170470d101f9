use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Engine-wide count of series that were started and whose completion
/// callback has not returned yet. `wait_finish` parks on it.
#[derive(Debug, Default)]
pub(crate) struct Outstanding {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Outstanding {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn release(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "outstanding counter underflow");
        *count = count.saturating_sub(1);

        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn get(&self) -> usize {
        *self.count.lock()
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }

    /// Returns `false` if work was still outstanding when `timeout` elapsed.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut count = self.count.lock();

        while *count > 0 {
            if self.drained.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_on_empty_returns() {
        let outstanding = Outstanding::new();
        outstanding.wait();
        assert!(outstanding.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_wait_blocks_until_released() {
        let outstanding = Arc::new(Outstanding::new());
        outstanding.acquire();
        outstanding.acquire();

        let releaser = {
            let outstanding = outstanding.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                outstanding.release();
                outstanding.release();
            })
        };

        outstanding.wait();
        assert_eq!(outstanding.get(), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let outstanding = Outstanding::new();
        outstanding.acquire();

        assert!(!outstanding.wait_timeout(Duration::from_millis(10)));
        outstanding.release();
        assert!(outstanding.wait_timeout(Duration::from_millis(10)));
    }
}
