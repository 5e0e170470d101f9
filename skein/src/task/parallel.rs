use crate::runtime::Handle;
use crate::task::context::ContextSlot;
use crate::task::{Series, Work, sealed};
use futures::future::BoxFuture;
use futures::task::AtomicWaker;
use parking_lot::MappedMutexGuard;
use std::any::Any;
use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Poll;
use tracing::{trace, warn};

type ParallelCallback = Box<dyn FnOnce(&Parallel) + Send>;

/// A fixed set of series running concurrently.
///
/// The parallel completes once every member series finished; its callback
/// then sees all members, contexts included. Member failures stay local to
/// the member. A parallel is itself a [`Work`] and can be pushed into a
/// series.
pub struct Parallel {
    members: Vec<Series>,
    context: ContextSlot,
    callback: Option<ParallelCallback>,
}

impl Default for Parallel {
    fn default() -> Self {
        Self::new()
    }
}

impl Parallel {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            context: ContextSlot::new(),
            callback: None,
        }
    }

    /// Adds a member, returning its index.
    pub fn add_series(&mut self, series: Series) -> usize {
        self.members.push(series);
        self.members.len() - 1
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn series_at(&self, index: usize) -> Option<&Series> {
        self.members.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Series> {
        self.members.iter()
    }

    pub fn set_callback<F>(&mut self, f: F)
    where
        F: FnOnce(&Parallel) + Send + 'static,
    {
        self.callback = Some(Box::new(f));
    }

    pub fn set_context<T: Any + Send>(&self, value: T) {
        self.context.set(value);
    }

    pub fn context<T: Any>(&self) -> Option<MappedMutexGuard<'_, T>> {
        self.context.lock::<T>()
    }

    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.context.with(f)
    }

    pub fn take_context<T: Any>(&self) -> Option<T> {
        self.context.take::<T>()
    }

    /// Starts the parallel in a new series on the current engine.
    pub fn start(self) {
        Series::new(self).start();
    }

    async fn run_in(mut self, handle: &Handle) {
        let countdown = Arc::new(Countdown::new(self.members.len()));
        trace!(members = self.members.len(), "parallel started");

        for member in &self.members {
            // A series that already runs reports to whoever started it, so
            // it counts as done here and must not learn about `countdown`.
            if !member.bind(handle) {
                warn!("series already started, skipped by parallel");
                countdown.arrive();
                continue;
            }

            let attached = member.set_parent(Arc::clone(&countdown));
            debug_assert!(attached, "unstarted series already has a parent");
            handle.drive_bound(member.clone());
        }

        countdown.wait().await;
        trace!("parallel finished");

        if let Some(callback) = self.callback.take() {
            callback(&self);
        }
    }
}

impl sealed::Sealed for Parallel {}

impl Work for Parallel {
    fn run<'a>(self: Box<Self>, _series: &'a Series, handle: &'a Handle) -> BoxFuture<'a, ()> {
        Box::pin((*self).run_in(handle))
    }
}

impl fmt::Debug for Parallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parallel")
            .field("members", &self.members)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Counts member series still running. The last one to arrive wakes the
/// parallel.
#[derive(Debug)]
pub(crate) struct Countdown {
    remaining: AtomicUsize,
    waker: AtomicWaker,
}

impl Countdown {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(n),
            waker: AtomicWaker::new(),
        }
    }

    pub(crate) fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.waker.wake();
        }
    }

    pub(crate) async fn wait(&self) {
        poll_fn(|cx| {
            if self.remaining.load(Ordering::Acquire) == 0 {
                return Poll::Ready(());
            }

            self.waker.register(cx.waker());

            // Re-check, the last arrival may have raced with `register`.
            if self.remaining.load(Ordering::Acquire) == 0 {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

/// A parallel over `series`, ready to be pushed into a series.
pub fn create_parallel_work<F>(series: Vec<Series>, callback: F) -> Parallel
where
    F: FnOnce(&Parallel) + Send + 'static,
{
    let mut parallel = Parallel::new();
    for s in series {
        parallel.add_series(s);
    }
    parallel.set_callback(callback);
    parallel
}

/// Creates and starts a parallel over `series` on the current engine.
pub fn start_parallel_work<F>(series: Vec<Series>, callback: F)
where
    F: FnOnce(&Parallel) + Send + 'static,
{
    create_parallel_work(series, callback).start();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::task::noop_waker;
    use std::task::Context;

    #[test]
    fn test_countdown_ready_after_last_arrival() {
        let countdown = Countdown::new(2);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = Box::pin(countdown.wait());
        assert!(wait.poll_unpin(&mut cx).is_pending());

        countdown.arrive();
        assert!(wait.poll_unpin(&mut cx).is_pending());

        countdown.arrive();
        assert!(wait.poll_unpin(&mut cx).is_ready());
    }

    #[test]
    fn test_empty_countdown_is_ready() {
        let countdown = Countdown::new(0);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Box::pin(countdown.wait()).poll_unpin(&mut cx).is_ready());
    }
}
