use crate::runtime::worker::panic_message;
use crossbeam_queue::SegQueue;
use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue drained by the compute threads. Anything that would block a worker
/// (go task closures, file reads and writes, name resolution) runs here and
/// reports back through a oneshot channel.
#[derive(Debug, Default)]
pub(crate) struct BlockingPool {
    queue: SegQueue<Job>,

    /// `true` once the pool is shutting down.
    closed: Mutex<bool>,
    available: Condvar,
}

impl BlockingPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues `f` on a compute thread. The receiver yields `Err` if `f`
    /// panicked, and is canceled if the pool shut down before running it.
    pub(crate) fn spawn<F, R>(&self, f: F) -> oneshot::Receiver<thread::Result<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        self.queue.push(Box::new(move || {
            let res = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(res);
        }));

        // Notify under the lock, `run` checks the queue while holding it.
        let _closed = self.closed.lock();
        self.available.notify_one();

        rx
    }

    /// Body of every compute thread.
    pub(crate) fn run(&self) {
        loop {
            {
                let mut closed = self.closed.lock();
                if *closed {
                    break;
                }

                if self.queue.is_empty() {
                    self.available.wait(&mut closed);
                    continue;
                }
            }

            if let Some(job) = self.queue.pop() {
                // Jobs catch their own panics, this only guards the channel send.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    warn!("compute job panicked: {}", panic_message(&*payload));
                }
            }
        }

        // Jobs still queued are dropped, their receivers observe `Canceled`.
        while self.queue.pop().is_some() {}
    }

    pub(crate) fn close(&self) {
        *self.closed.lock() = true;
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::Arc;

    fn start(threads: usize) -> (Arc<BlockingPool>, Vec<thread::JoinHandle<()>>) {
        let pool = Arc::new(BlockingPool::new());
        let handles = (0..threads)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.run())
            })
            .collect();
        (pool, handles)
    }

    #[test]
    fn test_spawn_returns_result() {
        let (pool, handles) = start(2);

        let receivers = (0..8).map(|i| pool.spawn(move || i * 2)).collect::<Vec<_>>();
        let results = receivers
            .into_iter()
            .map(|rx| block_on(rx).unwrap().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);

        pool.close();
        handles.into_iter().for_each(|h| h.join().unwrap());
    }

    #[test]
    fn test_panicking_job_reports_err() {
        let (pool, handles) = start(1);

        let rx = pool.spawn(|| -> u32 { panic!("nope") });
        assert!(block_on(rx).unwrap().is_err());

        // The thread survived the panic.
        assert_eq!(block_on(pool.spawn(|| 5)).unwrap().unwrap(), 5);

        pool.close();
        handles.into_iter().for_each(|h| h.join().unwrap());
    }

    #[test]
    fn test_closed_pool_cancels_pending_jobs() {
        let pool = BlockingPool::new();
        let rx = pool.spawn(|| 1);

        pool.close();
        pool.run();

        assert!(block_on(rx).is_err());
    }
}
