use crossbeam_deque::Injector;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

/// State shared by every worker of one engine.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) shutdown: AtomicBool,

    /// LIFO collection of parked workers. We unpark in LIFO order as the
    /// latest parked thread is the one where CPU cache will be the hottest.
    parked_threads: RwLock<VecDeque<Parked>>,
}

#[derive(Debug)]
struct Parked {
    thread: Thread,
    should_unpark: Arc<AtomicBool>,
}

impl Parked {
    fn unpark(self) {
        self.should_unpark.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

impl Shared {
    pub(crate) fn new(worker_threads: usize) -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            parked_threads: RwLock::new(VecDeque::with_capacity(worker_threads)),
        }
    }

    /// Parks the current thread until the scheduler hands out new work through
    /// the global injector or the engine shuts down.
    pub(crate) fn park_current_thread<T>(&self, injector: &Injector<T>) {
        let should_unpark = {
            let mut parked_threads = self.parked_threads.write();

            // Checked *while holding the lock*: `unpark_one_thread` pushes to
            // the injector before taking it.
            if !injector.is_empty() || self.shutdown.load(Ordering::Acquire) {
                return;
            }

            let should_unpark = Arc::new(AtomicBool::new(false));
            parked_threads.push_back(Parked {
                thread: thread::current(),
                should_unpark: Arc::clone(&should_unpark),
            });
            should_unpark
        };

        // Loop to absorb spurious wakeups.
        while !should_unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }

    pub(crate) fn unpark_one_thread(&self) -> bool {
        // Fast path, nobody is parked.
        if self.parked_threads.read().is_empty() {
            return false;
        }

        match self.parked_threads.write().pop_back() {
            Some(parked) => {
                parked.unpark();
                true
            }
            None => false,
        }
    }

    pub(crate) fn unpark_all_threads(&self) -> usize {
        let parked = self.parked_threads.write().drain(..).collect::<Vec<_>>();
        let num_unparked = parked.len();

        for p in parked {
            p.unpark();
        }

        num_unparked
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.parked_threads.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(Shared: Send, Sync);

    fn wait_for_parked(shared: &Shared, n: usize) {
        while shared.num_parked() < n {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_park_returns_when_injector_has_work() {
        let shared = Shared::new(1);
        let injector = Injector::new();
        injector.push(7);

        shared.park_current_thread(&injector);
        assert_eq!(shared.num_parked(), 0);
    }

    #[test]
    fn test_unpark_one_wakes_latest() {
        let shared = Arc::new(Shared::new(2));
        let injector = Arc::new(Injector::<u32>::new());

        let handles = (0..2)
            .map(|_| {
                let shared = shared.clone();
                let injector = injector.clone();
                thread::spawn(move || shared.park_current_thread(&injector))
            })
            .collect::<Vec<_>>();

        wait_for_parked(&shared, 2);

        assert!(shared.unpark_one_thread());
        assert_eq!(shared.num_parked(), 1);

        shared.shutdown.store(true, Ordering::Release);
        assert_eq!(shared.unpark_all_threads(), 1);
        assert!(!shared.unpark_one_thread());

        for h in handles {
            h.join().unwrap();
        }
    }
}
