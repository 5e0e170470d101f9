use crate::runtime::Handle;
use crate::runtime::worker::Worker;
use std::cell::RefCell;
use std::rc::Rc;
use std::thread_local;

mod shared;
pub(crate) use shared::Shared;

/// Per-thread view of the engine. Worker threads own their `Worker` here so
/// that scheduling from inside a running callback can reach the local queue.
#[derive(Default)]
struct Context {
    /// Engine used by free functions (`Task::start`, `wait_finish`, ...).
    current: RefCell<Option<Handle>>,

    /// Set on worker threads only.
    worker: RefCell<Option<Rc<Worker>>>,
}

thread_local! {
    static CONTEXT: Context = Context::default();
}

pub(crate) fn current() -> Option<Handle> {
    CONTEXT
        .try_with(|ctx| ctx.current.borrow().clone())
        .ok()
        .flatten()
}

/// Swaps the current engine, returning the previous one.
pub(crate) fn set_current(handle: Option<Handle>) -> Option<Handle> {
    CONTEXT
        .try_with(|ctx| ctx.current.replace(handle))
        .ok()
        .flatten()
}

pub(crate) fn init_worker(handle: Handle, worker: Rc<Worker>) {
    CONTEXT.with(|ctx| {
        ctx.current.replace(Some(handle));
        ctx.worker.replace(Some(worker));
    });
}

/// Drops the worker (and any work left in its local queue) before the thread
/// exits, while the engine is still alive.
pub(crate) fn take_worker() -> Option<Rc<Worker>> {
    CONTEXT
        .try_with(|ctx| {
            ctx.current.replace(None);
            ctx.worker.replace(None)
        })
        .ok()
        .flatten()
}

/// Runs `f` with the current thread's worker, if this thread is a worker of
/// the engine identified by `engine_id`.
pub(crate) fn with_worker<F, R>(engine_id: u64, f: F) -> Option<R>
where
    F: FnOnce(&Worker) -> R,
{
    CONTEXT
        .try_with(|ctx| {
            let worker = ctx.worker.borrow().clone()?;
            (worker.engine_id() == engine_id).then(|| f(&worker))
        })
        .ok()
        .flatten()
}

pub(crate) fn is_worker_thread() -> bool {
    CONTEXT
        .try_with(|ctx| ctx.worker.borrow().is_some())
        .unwrap_or(false)
}

/// Restores the previous current engine on drop.
pub(crate) struct EnterGuard {
    prev: Option<Handle>,
}

impl EnterGuard {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            prev: set_current(Some(handle)),
        }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        set_current(self.prev.take());
    }
}
