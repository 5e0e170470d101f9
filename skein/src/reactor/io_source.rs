use crate::reactor::Reactor;
use std::future::poll_fn;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;

/// A non-blocking I/O object registered with a [`Reactor`].
///
/// The fd is removed from the poller on drop, before `T` closes it.
#[derive(Debug)]
pub(crate) struct Async<T: AsFd> {
    reactor: Arc<Reactor>,
    key: usize,
    io: T,
}

impl<T: AsFd> Async<T> {
    /// `io` must already be in non-blocking mode.
    pub(crate) fn new(reactor: &Arc<Reactor>, io: T) -> Self {
        let key = reactor.register(io.as_fd().as_raw_fd());
        Self {
            reactor: Arc::clone(reactor),
            key,
            io,
        }
    }

    pub(crate) fn get_ref(&self) -> &T {
        &self.io
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub(crate) async fn readable(&self) -> io::Result<()> {
        poll_fn(|cx| self.reactor.poll_readable(self.key, cx.waker())).await
    }

    pub(crate) async fn writable(&self) -> io::Result<()> {
        poll_fn(|cx| self.reactor.poll_writable(self.key, cx.waker())).await
    }

    /// Retries `op` each time the fd becomes readable until it stops
    /// returning `WouldBlock`.
    pub(crate) async fn read_with<R>(
        &self,
        mut op: impl FnMut(&T) -> io::Result<R>,
    ) -> io::Result<R> {
        loop {
            match op(&self.io) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.readable().await?,
                res => return res,
            }
        }
    }

    pub(crate) async fn write_with<R>(
        &self,
        mut op: impl FnMut(&T) -> io::Result<R>,
    ) -> io::Result<R> {
        loop {
            match op(&self.io) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.writable().await?,
                res => return res,
            }
        }
    }
}

impl<T: AsFd> Drop for Async<T> {
    fn drop(&mut self) {
        self.reactor.deregister(self.key);
    }
}
