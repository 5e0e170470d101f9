use crate::context::{self, EnterGuard, Shared};
use crate::reactor::Reactor;
use crate::runtime::blocking::BlockingPool;
use crate::runtime::cancel::{AbortListener, AbortSignal};
use crate::runtime::outstanding::Outstanding;
use crate::runtime::pool::ThreadPool;
use crate::runtime::{EngineConfig, EventLoop, Schedule};
use crate::task::Series;
use anyhow::Result;
use async_task::Runnable;
use crossbeam_deque::{Injector, Steal};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Runs series and parallels to completion on a pool of worker threads.
///
/// Dropping the engine shuts it down: in-flight tasks complete with
/// [`State::Aborted`](crate::State::Aborted), queued tasks are dismissed and
/// every started series still gets its callback.
pub struct Engine {
    handle: Handle,
}

/// Cheap cloneable reference to a running [`Engine`].
#[derive(Clone)]
pub struct Handle(Arc<Inner>);

pub(crate) struct Inner {
    /// Distinguishes workers of different engines living in one process.
    id: u64,

    cfg: EngineConfig,

    /// Global injector queue, fed by threads that are not workers of this
    /// engine.
    injector: Arc<Injector<Runnable>>,

    /// Shared context between workers.
    shared: Arc<Shared>,

    reactor: Arc<Reactor>,

    blocking: Arc<BlockingPool>,

    /// Series started and not yet finished.
    outstanding: Outstanding,

    /// Fired once shutdown begins.
    abort: Arc<AbortSignal>,

    /// Set once shutdown begins, new top-level series are refused.
    closed: AtomicBool,

    workers: ThreadPool,
    compute: ThreadPool,
    reactor_thread: ThreadPool,
}

impl Engine {
    pub(crate) fn new(cfg: EngineConfig) -> Result<Engine> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let inner = Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            injector: Arc::new(Injector::new()),
            shared: Arc::new(Shared::new(cfg.worker_threads)),
            reactor: Arc::new(Reactor::new()?),
            blocking: Arc::new(BlockingPool::new()),
            outstanding: Outstanding::new(),
            abort: Arc::new(AbortSignal::new()),
            closed: AtomicBool::new(false),
            workers: ThreadPool::new(),
            compute: ThreadPool::new(),
            reactor_thread: ThreadPool::new(),
            cfg,
        };

        // From here on a failure drops the engine, which joins whatever was
        // already spawned.
        let engine = Engine {
            handle: Handle(Arc::new(inner)),
        };
        let inner = &engine.handle.0;

        let reactor = Arc::clone(&inner.reactor);
        inner.reactor_thread.spawn_thread(
            format!("skein-reactor-{}", inner.id),
            None,
            move || reactor.run(),
        )?;

        for _ in 0..inner.cfg.compute_threads {
            let blocking = Arc::clone(&inner.blocking);
            inner.compute.spawn_thread(
                inner.cfg.compute_thread_name.0(),
                inner.cfg.thread_stack_size,
                move || blocking.run(),
            )?;
        }

        inner.workers.spawn_workers(&engine.handle)?;

        debug!(
            engine = inner.id,
            workers = inner.workers.len(),
            compute = inner.compute.len(),
            "engine started"
        );

        Ok(engine)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Makes this engine the current one on this thread while `f` runs, so
    /// `Task::start`, `Series::start` and the free functions use it.
    pub fn enter<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = EnterGuard::new(self.handle.clone());
        f()
    }

    pub fn start_series(&self, series: Series) {
        self.handle.start_series(series);
    }

    /// See [`Handle::wait_finish`].
    pub fn wait_finish(&self) {
        self.handle.wait_finish();
    }

    /// See [`Handle::wait_finish_timeout`].
    pub fn wait_finish_timeout(&self, timeout: Duration) -> bool {
        self.handle.wait_finish_timeout(timeout)
    }

    /// Shuts the engine down.
    ///
    /// Blocks until every started series has called its callback and every
    /// engine thread has exited. The `Drop` implementation does the same.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        let inner = &self.handle.0;

        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(engine = inner.id, "engine shutting down");
        inner.abort.fire();

        if context::with_worker(inner.id, |_| ()).is_some() {
            error!(
                engine = inner.id,
                "engine dropped on one of its own workers, threads are left running"
            );
            return;
        }

        inner.outstanding.wait();

        inner.shared.shutdown.store(true, Ordering::Release);
        inner.shared.unpark_all_threads();
        if let Err(e) = inner.workers.join_all() {
            error!(engine = inner.id, "error joining workers: {:?}", e);
        }

        inner.reactor.stop();
        if let Err(e) = inner.reactor_thread.join_all() {
            error!(engine = inner.id, "error joining reactor: {:?}", e);
        }

        // Futures parked on I/O or timers are scheduled one last time so the
        // drain below drops them.
        inner.reactor.wake_all();

        inner.blocking.close();
        if let Err(e) = inner.compute.join_all() {
            error!(engine = inner.id, "error joining compute threads: {:?}", e);
        }

        // Dropping a runnable can wake more futures, loop until it stays empty.
        loop {
            match inner.injector.steal() {
                Steal::Success(runnable) => drop(runnable),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }

        debug!(engine = inner.id, "engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").field("handle", &self.handle).finish()
    }
}

impl Handle {
    /// The engine current on this thread: the one entered with
    /// [`Engine::enter`], the one owning this worker thread, or the global
    /// engine.
    pub fn current() -> Handle {
        super::global::current_handle()
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    pub(crate) fn cfg(&self) -> &EngineConfig {
        &self.0.cfg
    }

    pub(crate) fn injector(&self) -> &Arc<Injector<Runnable>> {
        &self.0.injector
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.0.shared
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.0.reactor
    }

    pub(crate) fn blocking(&self) -> &BlockingPool {
        &self.0.blocking
    }

    pub(crate) fn abort_listener(&self) -> AbortListener {
        self.0.abort.listen()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.0.abort.is_fired()
    }

    /// `true` once shutdown began.
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Number of series started on this engine whose callback has not
    /// returned yet.
    pub fn outstanding(&self) -> usize {
        self.0.outstanding.get()
    }

    /// Starts `series` on this engine. Refused, with a warning, once the
    /// engine is shutting down.
    pub fn start_series(&self, series: Series) {
        self.launch(series);
    }

    /// Blocks until every series and parallel started on this engine has
    /// finished, including series started while waiting.
    ///
    /// # Panics
    ///
    /// When called from one of this engine's worker threads, where it could
    /// never return.
    pub fn wait_finish(&self) {
        self.assert_not_worker("wait_finish");
        self.0.outstanding.wait();
    }

    /// Like [`Handle::wait_finish`] but gives up after `timeout`. Returns
    /// `false` if work was still outstanding.
    pub fn wait_finish_timeout(&self, timeout: Duration) -> bool {
        self.assert_not_worker("wait_finish_timeout");
        self.0.outstanding.wait_timeout(timeout)
    }

    #[track_caller]
    pub(crate) fn assert_not_worker(&self, what: &str) {
        assert!(
            context::with_worker(self.0.id, |_| ()).is_none(),
            "{} called from a worker thread of the same engine",
            what
        );
    }

    /// Spawns a detached future on the worker pool.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.0);
        let (runnable, task) = async_task::spawn(future, move |runnable| {
            // The engine is gone, dropping the runnable drops the future.
            if let Some(inner) = weak.upgrade() {
                inner.schedule(runnable);
            }
        });

        task.detach();
        runnable.schedule();
    }

    /// Starts driving a top-level `series`, refused once the engine is
    /// closed. Members of a running parallel go through
    /// [`drive_bound`](Self::drive_bound) instead so the parallel can
    /// complete. Returns `false` if the series will not run.
    pub(crate) fn launch(&self, series: Series) -> bool {
        if self.is_closed() {
            warn!(engine = self.0.id, "engine is shutting down, series refused");
            return false;
        }

        if !series.bind(self) {
            warn!(engine = self.0.id, "series already started");
            return false;
        }

        self.drive_bound(series);
        true
    }

    /// Spawns the driver of a series [`bind`](Series::bind) already attached
    /// to this engine.
    pub(crate) fn drive_bound(&self, series: Series) {
        self.0.outstanding.acquire();
        self.spawn(crate::task::series::drive(series, self.clone()));
    }

    /// Called once per launched series, after its callback returned.
    pub(crate) fn release(&self) {
        self.0.outstanding.release();
    }
}

impl Schedule for Inner {
    fn schedule(&self, runnable: Runnable) {
        let mut pending = Some(runnable);

        // Woken from one of our workers: keep it local, the cache is hot.
        let backlog = context::with_worker(self.id, |worker| {
            if let Some(runnable) = pending.take() {
                worker.add_task(runnable);
            }
            worker.backlog()
        });

        match pending {
            Some(runnable) => {
                self.injector.push(runnable);
                self.shared.unpark_one_thread();
            }
            None if backlog.is_some_and(|n| n > 1) => {
                // More local work than this worker can poll right now, let a
                // parked worker steal some.
                self.shared.unpark_one_thread();
            }
            None => {}
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.0.id)
            .field("workers", &self.0.cfg.worker_threads)
            .field("closed", &self.is_closed())
            .finish()
    }
}
