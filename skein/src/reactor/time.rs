use crate::reactor::Reactor;
use futures::future::{self, Either};
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Completes once `deadline` is reached. Dropping it cancels the timer.
///
/// A deadline past what `Instant` can represent never fires.
#[derive(Debug)]
pub(crate) struct Sleep {
    reactor: Arc<Reactor>,
    id: Option<u64>,
}

impl Sleep {
    pub(crate) fn until(reactor: &Arc<Reactor>, deadline: Instant) -> Self {
        Self {
            reactor: Arc::clone(reactor),
            id: Some(reactor.timer_create(deadline)),
        }
    }

    pub(crate) fn new(reactor: &Arc<Reactor>, duration: Duration) -> Self {
        match Instant::now().checked_add(duration) {
            Some(deadline) => Self::until(reactor, deadline),
            None => Self {
                reactor: Arc::clone(reactor),
                id: None,
            },
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.id {
            Some(id) => self.reactor.timer_poll(id, cx.waker()),
            None => Poll::Pending,
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.reactor.timer_cancel(id);
        }
    }
}

/// A deadline that may not exist. Without one it never completes.
#[derive(Debug)]
pub(crate) struct Expiry(Option<Sleep>);

impl Expiry {
    pub(crate) fn at(reactor: &Arc<Reactor>, deadline: Option<Instant>) -> Self {
        Self(deadline.map(|d| Sleep::until(reactor, d)))
    }
}

impl Future for Expiry {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.0.as_mut() {
            Some(sleep) => Pin::new(sleep).poll(cx),
            None => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Elapsed;

/// Runs `fut` to completion unless `duration` elapses first.
pub(crate) async fn timeout<F: Future>(
    reactor: &Arc<Reactor>,
    duration: Option<Duration>,
    fut: F,
) -> Result<F::Output, Elapsed> {
    let Some(duration) = duration else {
        return Ok(fut.await);
    };

    let fut = pin!(fut);
    match future::select(fut, Sleep::new(reactor, duration)).await {
        Either::Left((out, _)) => Ok(out),
        Either::Right(_) => Err(Elapsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::with_reactor;
    use futures::executor::block_on;
    use rstest::rstest;

    #[rstest]
    #[case::short(Duration::from_millis(5))]
    #[case::medium(Duration::from_millis(30))]
    fn test_sleep_waits_at_least(#[case] duration: Duration) {
        with_reactor(|reactor| {
            let start = Instant::now();
            block_on(Sleep::new(reactor, duration));
            assert!(start.elapsed() >= duration);
        });
    }

    #[test]
    fn test_timeout_elapses() {
        with_reactor(|reactor| {
            let res = block_on(timeout(
                reactor,
                Some(Duration::from_millis(10)),
                future::pending::<()>(),
            ));
            assert_eq!(res, Err(Elapsed));
        });
    }

    #[test]
    fn test_timeout_passes_output_through() {
        with_reactor(|reactor| {
            let res = block_on(timeout(reactor, Some(Duration::from_secs(5)), async { 7 }));
            assert_eq!(res, Ok(7));

            let res = block_on(timeout(reactor, None, async { 8 }));
            assert_eq!(res, Ok(8));
        });
    }

    #[test]
    fn test_unrepresentable_sleep_never_fires() {
        with_reactor(|reactor| {
            let res = block_on(timeout(
                reactor,
                Some(Duration::from_millis(5)),
                Sleep::new(reactor, Duration::MAX),
            ));
            assert_eq!(res, Err(Elapsed));

            let res = block_on(timeout(reactor, Some(Duration::MAX), async { 9 }));
            assert_eq!(res, Ok(9));
        });
    }

    #[test]
    fn test_expiry_without_deadline_is_pending() {
        with_reactor(|reactor| {
            let res = block_on(timeout(
                reactor,
                Some(Duration::from_millis(5)),
                Expiry::at(reactor, None),
            ));
            assert_eq!(res, Err(Elapsed));
        });
    }
}
