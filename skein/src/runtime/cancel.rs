use parking_lot::Mutex;
use slab::Slab;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

/// One-shot broadcast fired when the engine shuts down. Every running task
/// races its I/O step against a listener and completes with `Aborted` once the
/// signal fires.
#[derive(Debug, Default)]
pub(crate) struct AbortSignal {
    fired: AtomicBool,
    wakers: Mutex<Slab<Waker>>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }

        let wakers = self.wakers.lock().drain().collect::<Vec<_>>();
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn listen(self: &Arc<Self>) -> AbortListener {
        AbortListener {
            signal: Arc::clone(self),
            key: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct AbortListener {
    signal: Arc<AbortSignal>,
    key: Option<usize>,
}

impl Future for AbortListener {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.is_fired() {
            return Poll::Ready(());
        }

        let signal = Arc::clone(&self.signal);
        let mut wakers = signal.wakers.lock();

        // `fire` flips the flag before draining, re-check under the lock.
        if signal.is_fired() {
            return Poll::Ready(());
        }

        match self.key {
            Some(key) if wakers.contains(key) => {
                if !wakers[key].will_wake(cx.waker()) {
                    wakers[key] = cx.waker().clone();
                }
            }
            _ => self.key = Some(wakers.insert(cx.waker().clone())),
        }

        Poll::Pending
    }
}

impl Drop for AbortListener {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.signal.wakers.lock().try_remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::task::noop_waker;

    #[test]
    fn test_listener_ready_after_fire() {
        let signal = Arc::new(AbortSignal::new());
        let mut listener = signal.listen();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(listener.poll_unpin(&mut cx).is_pending());
        assert_eq!(signal.wakers.lock().len(), 1);

        signal.fire();
        assert!(listener.poll_unpin(&mut cx).is_ready());
        assert!(signal.wakers.lock().is_empty());
    }

    #[test]
    fn test_dropped_listener_unregisters() {
        let signal = Arc::new(AbortSignal::new());
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        {
            let mut listener = signal.listen();
            assert!(listener.poll_unpin(&mut cx).is_pending());
            assert!(listener.poll_unpin(&mut cx).is_pending());
            assert_eq!(signal.wakers.lock().len(), 1);
        }

        assert!(signal.wakers.lock().is_empty());
    }
}
