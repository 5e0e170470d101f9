use crate::context::Shared;
use crate::runtime::EventLoop;
use crate::runtime::EngineConfig;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use async_task::Runnable;
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace};

#[derive(Debug)]
pub(crate) struct Worker {
    engine_id: u64,

    index: usize,

    /// Determines how we run the event loop.
    cfg: RefCell<EventLoopConfig>,

    /// Event loop ticker.
    ticker: RefCell<Ticker>,

    /// Whether we should try to find our next runnable in the global queue.
    pop_global_queue: Cell<bool>,

    /// Global injector queue where work started from outside the pool lands.
    global: Arc<Injector<Runnable>>,

    shared: Arc<Shared>,

    /// Local LIFO queue. Work woken from this thread lands here, other workers
    /// can steal from it.
    local: CbWorker<Runnable>,

    /// Handle to all of the other worker's local queues. If there are N
    /// workers we will have N-1 queues to steal from.
    stealers: Vec<Stealer<Runnable>>,
}

impl Worker {
    pub(crate) fn new(
        engine_id: u64,
        index: usize,
        cfg: &EngineConfig,
        global: Arc<Injector<Runnable>>,
        shared: Arc<Shared>,
        local: CbWorker<Runnable>,
        mut stealers: Vec<Stealer<Runnable>>,
    ) -> Self {
        // Each worker gets its own search order to reduce contention while
        // stealing.
        fastrand::shuffle(&mut stealers);

        Self {
            engine_id,
            index,
            cfg: RefCell::new(cfg.into()),
            ticker: RefCell::new(Ticker::new()),
            pop_global_queue: Cell::new(false),
            global,
            shared,
            local,
            stealers,
        }
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine_id
    }

    /// Number of runnables waiting in the local queue.
    pub(crate) fn backlog(&self) -> usize {
        self.local.len()
    }

    fn tick(&self) -> TickerEvents {
        self.ticker
            .borrow_mut()
            .tick(&*self.shared, &mut *self.cfg.borrow_mut())
    }

    fn run_task(&self, runnable: Runnable) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| runnable.run())) {
            error!(
                worker = self.index,
                "panic while polling work: {}",
                panic_message(&*payload)
            );
        }
    }
}

impl EventLoop for Worker {
    type Task = Runnable;

    fn add_task(&self, task: Self::Task) {
        self.local.push(task);
    }

    fn find_task(&self) -> Option<Self::Task> {
        // Enforce fairness by force-checking the global queue with frequency
        // `global_queue_interval`.
        if self.pop_global_queue.replace(false)
            && let Some(task) = self.global.steal_batch_and_pop(&self.local).success()
        {
            return Some(task);
        }

        self.local.pop().or_else(|| {
            // No local work, repeatedly try the global injector and other
            // workers' local queues.
            iter::repeat_with(|| {
                self.global.steal_batch_and_pop(&self.local).or_else(||
                    // `collect` stops at the first `Success`.
                    self.stealers.iter().map(|s| s.steal()).collect())
            })
            .take(self.cfg.borrow().max_steal_retries)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    fn event_loop(&self) {
        debug!(worker = self.index, "worker started");

        loop {
            if let Some(task) = self.find_task() {
                self.run_task(task);
            } else {
                trace!(worker = self.index, "parking");
                self.shared.park_current_thread(&self.global);
            }

            let events = self.tick();
            if events.contains(TickerEvents::SHUTDOWN) {
                break;
            } else if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
                self.pop_global_queue.set(true);
            }
        }

        debug!(worker = self.index, "worker stopped");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    global_queue_interval: u32,
    max_steal_retries: usize,
}

impl From<&EngineConfig> for EventLoopConfig {
    fn from(cfg: &EngineConfig) -> EventLoopConfig {
        EventLoopConfig {
            global_queue_interval: cfg.global_queue_interval,
            max_steal_retries: cfg.max_steal_retries,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Shared;

    #[inline(always)]
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents {
        if ctx.shutdown.load(Ordering::Acquire) {
            return TickerEvents::SHUTDOWN;
        }

        if tick.is_multiple_of(self.global_queue_interval) {
            TickerEvents::POP_GLOBAL_QUEUE
        } else {
            TickerEvents::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use std::convert::TryFrom;
    use std::sync::atomic::AtomicUsize;

    fn counting_runnable(hits: &Arc<AtomicUsize>) -> Runnable {
        let hits = hits.clone();
        let (runnable, task) = async_task::spawn(
            async move {
                hits.fetch_add(1, Ordering::Relaxed);
            },
            |_| {},
        );
        task.detach();
        runnable
    }

    fn lone_worker(global: Arc<Injector<Runnable>>, stealers: Vec<Stealer<Runnable>>) -> Worker {
        let cfg = EngineConfig::try_from(Builder::new().worker_threads(1)).unwrap();
        Worker::new(
            1,
            0,
            &cfg,
            global,
            Arc::new(Shared::new(1)),
            CbWorker::new_lifo(),
            stealers,
        )
    }

    #[test]
    fn test_find_task_prefers_local_then_global_then_steals() {
        let hits = Arc::new(AtomicUsize::new(0));
        let global = Arc::new(Injector::new());

        let other = CbWorker::new_lifo();
        let worker = lone_worker(global.clone(), vec![other.stealer()]);

        worker.add_task(counting_runnable(&hits));
        global.push(counting_runnable(&hits));
        other.push(counting_runnable(&hits));

        let mut found = 0;
        while let Some(task) = worker.find_task() {
            worker.run_task(task);
            found += 1;
        }

        assert_eq!(found, 3);
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert!(global.is_empty());
        assert!(other.is_empty());
    }

    #[test]
    fn test_panicking_runnable_is_contained() {
        let worker = lone_worker(Arc::new(Injector::new()), vec![]);
        let (runnable, task) = async_task::spawn(async { panic!("boom") }, |_| {});
        task.detach();

        worker.run_task(runnable);
        assert!(worker.find_task().is_none());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");

        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(&*payload), "<non-string panic payload>");
    }
}
