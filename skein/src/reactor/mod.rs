use parking_lot::Mutex;
use polling::{Event, Events, Poller};
use slab::Slab;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub(crate) mod io_source;
pub(crate) use io_source::Async;

pub(crate) mod net;

pub(crate) mod time;

/// An fd registered with the reactor.
#[derive(Debug)]
struct Source {
    raw_fd: RawFd,
    key: usize,

    /// Whether `poller.add()` was called for this source.
    registered: bool,

    read_waker: Option<Waker>,
    write_waker: Option<Waker>,

    /// Set when the OS reports readiness, cleared by the next poll.
    read_ready: bool,
    write_ready: bool,
}

#[derive(Debug, Default)]
struct Timers {
    /// Ordered by (deadline, id) for expiry scanning.
    heap: BTreeMap<(Instant, u64), Waker>,

    /// Timer id -> deadline, for cancel and poll by id.
    deadlines: HashMap<u64, Instant>,
}

/// Owns the OS poller, registered fds and the timer heap of one engine. A
/// dedicated thread calls [`Reactor::run`]; workers only register interest.
#[derive(Debug)]
pub(crate) struct Reactor {
    poller: Poller,
    sources: Mutex<Slab<Source>>,
    timers: Mutex<Timers>,
    timer_id: AtomicU64,
    events: Mutex<Events>,
    stopped: AtomicBool,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            sources: Mutex::new(Slab::new()),
            timers: Mutex::new(Timers::default()),
            timer_id: AtomicU64::new(0),
            events: Mutex::new(Events::new()),
            stopped: AtomicBool::new(false),
        })
    }

    // IO

    /// Registers an fd. It is only added to the OS poller on first poll.
    pub(crate) fn register(&self, raw_fd: RawFd) -> usize {
        let mut sources = self.sources.lock();
        let entry = sources.vacant_entry();
        let key = entry.key();
        entry.insert(Source {
            raw_fd,
            key,
            registered: false,
            read_waker: None,
            write_waker: None,
            read_ready: false,
            write_ready: false,
        });
        key
    }

    /// Must run before the fd is closed.
    pub(crate) fn deregister(&self, key: usize) {
        let source = self.sources.lock().try_remove(key);

        if let Some(source) = source
            && source.registered
        {
            let borrowed = unsafe { BorrowedFd::borrow_raw(source.raw_fd) };
            if let Err(e) = self.poller.delete(borrowed) {
                debug!(fd = source.raw_fd, "failed to remove fd from poller: {}", e);
            }
        }
    }

    pub(crate) fn poll_readable(&self, key: usize, waker: &Waker) -> Poll<io::Result<()>> {
        let mut sources = self.sources.lock();
        let Some(source) = sources.get_mut(key) else {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected)));
        };

        if source.read_ready {
            source.read_ready = false;
            return Poll::Ready(Ok(()));
        }

        source.read_waker = Some(waker.clone());
        match self.update_interest(source) {
            Ok(()) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    pub(crate) fn poll_writable(&self, key: usize, waker: &Waker) -> Poll<io::Result<()>> {
        let mut sources = self.sources.lock();
        let Some(source) = sources.get_mut(key) else {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected)));
        };

        if source.write_ready {
            source.write_ready = false;
            return Poll::Ready(Ok(()));
        }

        source.write_waker = Some(waker.clone());
        match self.update_interest(source) {
            Ok(()) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    /// Syncs OS poller interest with the wakers currently stored. Interest is
    /// oneshot, every event disarms the fd.
    fn update_interest(&self, source: &mut Source) -> io::Result<()> {
        let interest = Event::new(
            source.key,
            source.read_waker.is_some(),
            source.write_waker.is_some(),
        );

        if source.registered {
            let borrowed = unsafe { BorrowedFd::borrow_raw(source.raw_fd) };
            self.poller.modify(borrowed, interest)
        } else {
            // Safety: `Async` deregisters the fd before closing it.
            unsafe { self.poller.add(source.raw_fd, interest)? };
            source.registered = true;
            Ok(())
        }
    }

    // Timers

    pub(crate) fn timer_create(&self, deadline: Instant) -> u64 {
        let id = self.timer_id.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().deadlines.insert(id, deadline);
        id
    }

    /// Drops the stored waker without waking it.
    pub(crate) fn timer_cancel(&self, id: u64) {
        let mut timers = self.timers.lock();
        if let Some(deadline) = timers.deadlines.remove(&id) {
            timers.heap.remove(&(deadline, id));
        }
    }

    pub(crate) fn timer_poll(&self, id: u64, waker: &Waker) -> Poll<()> {
        let mut timers = self.timers.lock();
        let Some(&deadline) = timers.deadlines.get(&id) else {
            // Already fired or cancelled.
            return Poll::Ready(());
        };

        if Instant::now() >= deadline {
            timers.deadlines.remove(&id);
            timers.heap.remove(&(deadline, id));
            return Poll::Ready(());
        }

        let is_new = timers.heap.insert((deadline, id), waker.clone()).is_none();
        let is_earliest = timers.heap.keys().next() == Some(&(deadline, id));
        drop(timers);

        // The reactor thread may be sleeping past this deadline.
        if is_new && is_earliest {
            self.notify();
        }

        Poll::Pending
    }

    // React

    /// Fires expired timers, waits for OS events (bounded by the next timer)
    /// and wakes every task whose fd became ready.
    pub(crate) fn react(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut wakers = Vec::new();

        let next_timer = {
            let now = Instant::now();
            let mut timers = self.timers.lock();
            loop {
                match timers.heap.first_key_value().map(|(k, _)| *k) {
                    Some((deadline, id)) if deadline <= now => {
                        if let Some(waker) = timers.heap.remove(&(deadline, id)) {
                            wakers.push(waker);
                        }
                        timers.deadlines.remove(&id);
                    }
                    Some((deadline, _)) => break Some(deadline.duration_since(now)),
                    None => break None,
                }
            }
        };

        let effective_timeout = match (timeout, next_timer) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        };

        // Wake expired timers before possibly blocking in the poller.
        if !wakers.is_empty() {
            wakers.drain(..).for_each(Waker::wake);
        }

        let ready = {
            let mut events = self.events.lock();
            events.clear();
            self.poller.wait(&mut events, effective_timeout)?;
            events
                .iter()
                .map(|ev| (ev.key, ev.readable, ev.writable))
                .collect::<Vec<_>>()
        };

        {
            let mut sources = self.sources.lock();
            for (key, readable, writable) in ready {
                let Some(source) = sources.get_mut(key) else {
                    continue;
                };

                if readable {
                    source.read_ready = true;
                    wakers.extend(source.read_waker.take());
                }

                if writable {
                    source.write_ready = true;
                    wakers.extend(source.write_waker.take());
                }

                // The event disarmed the fd, re-arm for a direction still waited on.
                if (source.read_waker.is_some() || source.write_waker.is_some())
                    && let Err(e) = self.update_interest(source)
                {
                    debug!(fd = source.raw_fd, "failed to re-arm fd: {}", e);
                }
            }
        }

        wakers.into_iter().for_each(Waker::wake);
        Ok(())
    }

    /// Body of the reactor thread.
    pub(crate) fn run(&self) {
        while !self.stopped.load(Ordering::Acquire) {
            if let Err(e) = self.react(None)
                && e.kind() != io::ErrorKind::Interrupted
            {
                error!("reactor failed to poll: {}", e);
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify();
    }

    fn notify(&self) {
        if let Err(e) = self.poller.notify() {
            error!("failed to notify reactor: {}", e);
        }
    }

    /// Wakes every stored waker. Used after the reactor thread stopped so
    /// parked futures get scheduled one last time and dropped.
    pub(crate) fn wake_all(&self) {
        let mut wakers = {
            let mut timers = self.timers.lock();
            timers.deadlines.clear();
            std::mem::take(&mut timers.heap)
                .into_values()
                .collect::<Vec<_>>()
        };

        {
            let mut sources = self.sources.lock();
            for (_, source) in sources.iter_mut() {
                wakers.extend(source.read_waker.take());
                wakers.extend(source.write_waker.take());
            }
        }

        wakers.into_iter().for_each(Waker::wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::flag_waker;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_timer_expired_is_ready() -> io::Result<()> {
        let reactor = Reactor::new()?;
        let (waker, _) = flag_waker();

        let id = reactor.timer_create(Instant::now());
        assert_eq!(reactor.timer_poll(id, &waker), Poll::Ready(()));
        Ok(())
    }

    #[test]
    fn test_timer_cancel_drops_entry() -> io::Result<()> {
        let reactor = Reactor::new()?;
        let (waker, woken) = flag_waker();

        let id = reactor.timer_create(Instant::now() + Duration::from_secs(10));
        assert_eq!(reactor.timer_poll(id, &waker), Poll::Pending);

        reactor.timer_cancel(id);
        assert!(reactor.timers.lock().heap.is_empty());
        assert!(!woken.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_react_fires_expired_timers() -> io::Result<()> {
        let reactor = Reactor::new()?;
        let (waker, woken) = flag_waker();

        let id = reactor.timer_create(Instant::now() + Duration::from_millis(10));
        assert_eq!(reactor.timer_poll(id, &waker), Poll::Pending);

        for _ in 0..100 {
            reactor.react(Some(Duration::from_millis(50)))?;
            if woken.load(Ordering::SeqCst) {
                break;
            }
        }

        assert!(woken.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_stop_interrupts_run() -> io::Result<()> {
        let reactor = Arc::new(Reactor::new()?);
        let done = Arc::new(AtomicBool::new(false));

        let handle = {
            let reactor = reactor.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                reactor.run();
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        reactor.stop();
        handle.join().unwrap();

        assert!(done.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_wake_all_flushes_timers() -> io::Result<()> {
        let reactor = Reactor::new()?;
        let (waker, woken) = flag_waker();

        let id = reactor.timer_create(Instant::now() + Duration::from_secs(60));
        assert_eq!(reactor.timer_poll(id, &waker), Poll::Pending);

        reactor.wake_all();
        assert!(woken.load(Ordering::SeqCst));
        assert_eq!(reactor.timer_poll(id, &waker), Poll::Ready(()));
        Ok(())
    }
}
