use crate::runtime::Handle;
use crate::task::{Fault, Task, TaskKind};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::task::AtomicWaker;
use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};
use std::task::Poll;

/// Named counters still waiting for counts, in creation order.
static COUNTERS: LazyLock<DashMap<String, VecDeque<Arc<CounterState>>>> =
    LazyLock::new(DashMap::new);

#[derive(Debug)]
struct CounterState {
    name: Option<String>,
    target: u32,
    count: AtomicU32,
    waker: AtomicWaker,
}

impl CounterState {
    fn is_done(&self) -> bool {
        self.count.load(Ordering::Acquire) >= self.target
    }

    /// Returns `true` for the count that reached the target.
    fn bump(&self) -> bool {
        let reached = self.count.fetch_add(1, Ordering::AcqRel) + 1 == self.target;
        if reached {
            self.waker.wake();
        }
        reached
    }

    fn unregister(self: &Arc<Self>) {
        let Some(name) = &self.name else {
            return;
        };

        if let Some(mut counters) = COUNTERS.get_mut(name) {
            counters.retain(|c| !Arc::ptr_eq(c, self));
        }
        COUNTERS.remove_if(name, |_, counters| counters.is_empty());
    }
}

/// Completes once it has been counted `target` times, either through
/// [`Task::count`] or [`count_by_name`].
#[derive(Debug)]
pub struct Counter {
    state: Arc<CounterState>,
}

impl Counter {
    pub fn new(name: Option<String>, target: u32) -> Self {
        let state = Arc::new(CounterState {
            name,
            target,
            count: AtomicU32::new(0),
            waker: AtomicWaker::new(),
        });

        if let Some(name) = &state.name
            && target > 0
        {
            COUNTERS
                .entry(name.clone())
                .or_default()
                .push_back(Arc::clone(&state));
        }

        Self { state }
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        // Never reached: stop absorbing counts meant for other counters.
        if !self.state.is_done() {
            self.state.unregister();
        }
    }
}

impl TaskKind for Counter {
    type Request = ();
    type Response = ();

    fn execute<'a>(task: &'a mut Task<Self>, _handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>> {
        let state = Arc::clone(&task.kind.state);

        Box::pin(async move {
            poll_fn(|cx| {
                if state.is_done() {
                    return Poll::Ready(());
                }

                state.waker.register(cx.waker());

                if state.is_done() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
            .await;

            Ok(())
        })
    }
}

/// Counts a counter task from anywhere, the task itself being owned by its
/// series.
#[derive(Debug, Clone)]
pub struct CounterHandle(Arc<CounterState>);

impl CounterHandle {
    pub fn count(&self) {
        if self.0.bump() {
            self.0.unregister();
        }
    }
}

impl Task<Counter> {
    pub fn count(&self) {
        self.counter().count();
    }

    pub fn counter(&self) -> CounterHandle {
        CounterHandle(Arc::clone(&self.kind.state))
    }

    pub fn target(&self) -> u32 {
        self.kind.state.target
    }
}

/// Counts `n` times on the counters named `name`, oldest first. Counts left
/// over once no such counter remains are dropped.
pub fn count_by_name(name: &str, n: u32) {
    let mut remaining = n;

    if let Some(mut counters) = COUNTERS.get_mut(name) {
        while remaining > 0 {
            let Some(counter) = counters.front() else {
                break;
            };

            remaining -= 1;
            if counter.bump() {
                counters.pop_front();
            }
        }
    }

    COUNTERS.remove_if(name, |_, counters| counters.is_empty());
}
