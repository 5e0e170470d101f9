/// Runs a closure when dropped, unless disarmed first.
///
/// Used to finalize a series when its driver future unwinds or is dropped
/// before it reached the end of its queue.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken on drop or disarm so the closure runs at most once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    #[allow(unused)]
    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop() {
        let hits = Cell::new(0);
        {
            let _guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
            assert_eq!(hits.get(), 0);
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_disarmed_guard_does_nothing() {
        let hits = Cell::new(0);
        {
            let mut guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
            guard.disarm();
        }
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_runs_while_unwinding() {
        let hits = std::sync::atomic::AtomicUsize::new(0);
        let res = std::panic::catch_unwind(|| {
            let _guard = ScopeGuard::new(|| {
                hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            });
            panic!("boom");
        });

        assert!(res.is_err());
        assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
