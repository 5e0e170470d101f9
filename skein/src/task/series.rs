use crate::runtime::Handle;
use crate::runtime::worker::panic_message;
use crate::task::Work;
use crate::task::context::ContextSlot;
use crate::task::parallel::Countdown;
use crate::utils::ScopeGuard;
use parking_lot::{MappedMutexGuard, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, trace, warn};

type SeriesCallback = Box<dyn FnOnce(&Series) + Send>;

/// An ordered queue of work sharing one context.
///
/// Work runs strictly one after the other. Work pushed from a task callback
/// runs before the series callback, which fires exactly once when the queue
/// drains. Cloning gives another handle to the same series.
#[derive(Clone)]
pub struct Series(Arc<Inner>);

struct Inner {
    queue: Mutex<Queue>,
    context: ContextSlot,
    callback: Mutex<Option<SeriesCallback>>,
    canceled: AtomicBool,

    /// Number of works dequeued so far.
    task_seq: AtomicU64,

    /// Set by `finish`, guards the callback.
    finished: AtomicBool,

    /// Present when the series is a member of a parallel.
    parent: OnceLock<Arc<Countdown>>,

    /// Engine driving the series, set when it starts.
    handle: OnceLock<Handle>,
}

#[derive(Default)]
struct Queue {
    works: VecDeque<Box<dyn Work>>,

    /// No more work is accepted once the driver saw the queue empty.
    closed: bool,
}

impl Series {
    /// A series always holds at least one work.
    pub fn new(first: impl Work) -> Self {
        let mut works = VecDeque::new();
        works.push_back(Box::new(first) as Box<dyn Work>);

        Series(Arc::new(Inner {
            queue: Mutex::new(Queue {
                works,
                closed: false,
            }),
            context: ContextSlot::new(),
            callback: Mutex::new(None),
            canceled: AtomicBool::new(false),
            task_seq: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            parent: OnceLock::new(),
            handle: OnceLock::new(),
        }))
    }

    /// Appends `work`. Refused, with a warning, once the series drained.
    pub fn push_back(&self, work: impl Work) {
        self.push(Box::new(work), false);
    }

    /// Makes `work` the next one to run.
    pub fn push_front(&self, work: impl Work) {
        self.push(Box::new(work), true);
    }

    fn push(&self, work: Box<dyn Work>, front: bool) {
        let mut queue = self.0.queue.lock();
        if queue.closed {
            drop(queue);
            warn!("work pushed to a finished series, dropped");
            drop(work);
            return;
        }

        if front {
            queue.works.push_front(work);
        } else {
            queue.works.push_back(work);
        }
    }

    /// Starts the series on the current engine.
    pub fn start(self) {
        Handle::current().start_series(self);
    }

    /// Dismisses everything still queued. The running work completes and the
    /// series callback still fires.
    pub fn cancel(&self) {
        self.0.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.canceled.load(Ordering::Acquire)
    }

    /// Number of works this series has dequeued so far. Inside a task
    /// callback it is the 1-based position of that task.
    pub fn task_seq(&self) -> u64 {
        self.0.task_seq.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::Acquire)
    }

    /// Called once with the series after its queue drained.
    pub fn set_callback<F>(&self, f: F)
    where
        F: FnOnce(&Series) + Send + 'static,
    {
        *self.0.callback.lock() = Some(Box::new(f));
    }

    pub fn set_context<T: Any + Send>(&self, value: T) {
        self.0.context.set(value);
    }

    /// Locks the context and returns it if it holds a `T`.
    pub fn context<T: Any>(&self) -> Option<MappedMutexGuard<'_, T>> {
        self.0.context.lock::<T>()
    }

    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.0.context.with(f)
    }

    pub fn take_context<T: Any>(&self) -> Option<T> {
        self.0.context.take::<T>()
    }

    pub fn context_slot(&self) -> &ContextSlot {
        &self.0.context
    }

    /// Attaches the series to an engine. `false` if it already started.
    pub(crate) fn bind(&self, handle: &Handle) -> bool {
        self.0.handle.set(handle.clone()).is_ok()
    }

    pub(crate) fn set_parent(&self, parent: Arc<Countdown>) -> bool {
        self.0.parent.set(parent).is_ok()
    }

    fn next_work(&self, handle: &Handle) -> Option<Box<dyn Work>> {
        let mut queue = self.0.queue.lock();

        if self.is_canceled() || handle.is_aborted() {
            queue.closed = true;
            let dismissed = mem::take(&mut queue.works);
            drop(queue);

            if !dismissed.is_empty() {
                debug!(dismissed = dismissed.len(), "series dismissed queued work");
            }
            return None;
        }

        match queue.works.pop_front() {
            Some(work) => {
                self.0.task_seq.fetch_add(1, Ordering::AcqRel);
                Some(work)
            }
            None => {
                queue.closed = true;
                None
            }
        }
    }

    /// Runs the series callback, exactly once, then notifies the parent
    /// parallel and the engine.
    fn finish(&self, handle: &Handle) {
        let leftover = {
            let mut queue = self.0.queue.lock();
            queue.closed = true;
            mem::take(&mut queue.works)
        };
        drop(leftover);

        if self.0.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        trace!(task_seq = self.task_seq(), "series finished");

        let callback = self.0.callback.lock().take();
        if let Some(callback) = callback
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self)))
        {
            error!("series callback panicked: {}", panic_message(&*payload));
        }

        if let Some(parent) = self.0.parent.get() {
            parent.arrive();
        }

        handle.release();
    }
}

/// Driver future of a series: runs every work in order, then finishes. The
/// series still finishes if a work panics or the future is dropped.
pub(crate) async fn drive(series: Series, handle: Handle) {
    trace!("series started");
    let _finish = ScopeGuard::new(|| series.finish(&handle));

    while let Some(work) = series.next_work(&handle) {
        work.run(&series, &handle).await;
    }
}

impl fmt::Debug for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Series")
            .field("queued", &self.0.queue.lock().works.len())
            .field("task_seq", &self.task_seq())
            .field("canceled", &self.is_canceled())
            .field("finished", &self.is_finished())
            .finish()
    }
}
