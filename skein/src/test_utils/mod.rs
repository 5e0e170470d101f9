use crate::reactor::Reactor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::task::{Wake, Waker};
use std::thread;

struct FlagWaker(Arc<AtomicBool>);

impl Wake for FlagWaker {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A waker raising the returned flag when woken.
pub(crate) fn flag_waker() -> (Waker, Arc<AtomicBool>) {
    let woken = Arc::new(AtomicBool::new(false));
    let waker = Waker::from(Arc::new(FlagWaker(woken.clone())));
    (waker, woken)
}

/// Runs `f` against a reactor driven by its own thread, stopping it after.
pub(crate) fn with_reactor<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<Reactor>) -> R,
{
    let reactor = Arc::new(Reactor::new().expect("failed to create reactor"));

    let driver = {
        let reactor = reactor.clone();
        thread::spawn(move || reactor.run())
    };

    let out = f(&reactor);

    reactor.stop();
    driver.join().expect("reactor thread panicked");
    out
}

/// Collects values from callbacks running on any thread.
#[derive(Debug)]
pub(crate) struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Recorder<T> {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub(crate) fn record(&self, value: T) {
        self.0.lock().push(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub(crate) fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.0.lock())
    }
}

static TRACING: Once = Once::new();

/// Logs to the test writer, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
