use crate::reactor::time::Expiry;
use crate::runtime::Handle;
use crate::runtime::worker::panic_message;
use crate::task::state::errors;
use crate::task::{Id, Series, State, TimeoutReason, Work};
use futures::future::{BoxFuture, FutureExt};
use futures::select_biased;
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Why an I/O step failed. Turned into the `(state, error, timeout_reason)`
/// triple the callback observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// errno
    Sys(i32),

    /// `ETIMEDOUT` raised by one of the task's own timers.
    Timeout(TimeoutReason),

    /// `getaddrinfo` code
    Dns(i32),

    Ssl(i32),

    /// One of [`errors`](crate::errors).
    Task(i32),
}

impl Fault {
    /// Transport failures worth another attempt. Timeouts are final: the
    /// deadline would only fire again.
    fn is_retryable(&self) -> bool {
        match self {
            Fault::Sys(errno) => *errno != libc::ECANCELED,
            Fault::Dns(_) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Fault {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Fault::Sys(errno),
            None if e.kind() == io::ErrorKind::TimedOut => Fault::Sys(libc::ETIMEDOUT),
            None if e.kind() == io::ErrorKind::UnexpectedEof => Fault::Sys(libc::ECONNRESET),
            None => Fault::Sys(libc::EIO),
        }
    }
}

/// What a task does when its series reaches it.
///
/// Implemented by every built-in kind (timers, go tasks, counters, file and
/// network tasks) and open to user kinds.
pub trait TaskKind: Sized + Send + 'static {
    type Request: Send + 'static;
    type Response: Default + Send + 'static;

    /// Runs the I/O step. On success `task.resp` holds the response.
    ///
    /// May run more than once when the task retries, with `task.resp` reset
    /// between attempts.
    fn execute<'a>(task: &'a mut Task<Self>, handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>>;

    /// Runs after the final state is set and before the user callback.
    fn on_complete(_task: &mut Task<Self>) {}
}

type Callback<K> = Box<dyn FnOnce(&mut Task<K>) + Send>;

/// A single asynchronous unit of work of kind `K`.
///
/// A task is owned by exactly one series. Its callback runs exactly once, on
/// the worker that completed it, and may push more work onto
/// [`Task::series`] before the series moves on.
pub struct Task<K: TaskKind> {
    id: Id,
    state: State,
    error: i32,
    timeout_reason: TimeoutReason,

    retry_max: u32,
    retry_count: u32,

    /// Watch timeout covering every attempt.
    deadline: Option<Duration>,

    pub(crate) kind: K,
    pub(crate) req: K::Request,
    pub(crate) resp: K::Response,

    user_data: Option<Box<dyn Any + Send>>,
    callback: Option<Callback<K>>,

    /// Set while the task runs.
    series: Option<Series>,
}

impl<K: TaskKind> Task<K> {
    pub fn new(kind: K, req: K::Request) -> Self {
        Self {
            id: Id::next(),
            state: State::Pending,
            error: 0,
            timeout_reason: TimeoutReason::NotTimeout,
            retry_max: 0,
            retry_count: 0,
            deadline: None,
            kind,
            req,
            resp: K::Response::default(),
            user_data: None,
            callback: None,
            series: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Meaningful when [`Task::state`] is a failure.
    pub fn error(&self) -> i32 {
        self.error
    }

    pub fn timeout_reason(&self) -> TimeoutReason {
        self.timeout_reason
    }

    /// Attempts made on top of the first one.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn set_retry_max(&mut self, retry_max: u32) {
        self.retry_max = retry_max;
    }

    /// Bounds the whole task, retries included. On expiry the task fails
    /// with `ETIMEDOUT` and [`TimeoutReason::Wait`].
    pub fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = Some(deadline);
    }

    pub fn set_callback<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Task<K>) + Send + 'static,
    {
        self.callback = Some(Box::new(f));
    }

    pub fn req(&self) -> &K::Request {
        &self.req
    }

    pub fn req_mut(&mut self) -> &mut K::Request {
        &mut self.req
    }

    pub fn resp(&self) -> &K::Response {
        &self.resp
    }

    pub fn resp_mut(&mut self) -> &mut K::Response {
        &mut self.resp
    }

    /// Moves the response out. The task is dropped once its callback returns,
    /// this is how a callback keeps the response.
    pub fn take_resp(&mut self) -> K::Response {
        std::mem::take(&mut self.resp)
    }

    pub fn set_user_data<T: Any + Send>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref::<T>()
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut::<T>()
    }

    pub fn take_user_data<T: Any>(&mut self) -> Option<T> {
        if !self.user_data.as_ref().is_some_and(|data| data.is::<T>()) {
            return None;
        }

        self.user_data.take()?.downcast::<T>().ok().map(|data| *data)
    }

    /// The series running this task. `None` before the task starts.
    pub fn series(&self) -> Option<&Series> {
        self.series.as_ref()
    }

    /// Starts the task in a new series on the current engine.
    pub fn start(self) {
        Series::new(self).start();
    }

    fn apply(&mut self, outcome: Outcome) {
        let (state, error, reason) = match outcome {
            Outcome::Done(Ok(())) => (State::Success, 0, TimeoutReason::NotTimeout),
            Outcome::Done(Err(fault)) => match fault {
                Fault::Sys(errno) => (State::SysError, errno, TimeoutReason::NotTimeout),
                Fault::Timeout(reason) => (State::SysError, libc::ETIMEDOUT, reason),
                Fault::Dns(code) => (State::DnsError, code, TimeoutReason::NotTimeout),
                Fault::Ssl(code) => (State::SslError, code, TimeoutReason::NotTimeout),
                Fault::Task(code) => (State::TaskError, code, TimeoutReason::NotTimeout),
            },
            Outcome::Expired => (State::SysError, libc::ETIMEDOUT, TimeoutReason::Wait),
            Outcome::Aborted => (State::Aborted, libc::ECANCELED, TimeoutReason::NotTimeout),
        };

        self.state = state;
        self.error = error;
        self.timeout_reason = reason;
    }

    /// Runs the task to completion inside `series`, then its callback.
    async fn run_in(&mut self, series: &Series, handle: &Handle) {
        self.state = State::Running;
        self.series = Some(series.clone());

        trace!(task = self.id.as_u64(), "task running");

        let deadline = self.deadline.and_then(|d| Instant::now().checked_add(d));
        let mut expiry = Expiry::at(handle.reactor(), deadline).fuse();
        let mut abort = handle.abort_listener().fuse();

        let outcome = loop {
            let outcome = {
                let mut step = pin!(AssertUnwindSafe(async { K::execute(self, handle).await })
                    .catch_unwind()
                    .fuse());

                select_biased! {
                    _ = abort => Outcome::Aborted,
                    res = step => match res {
                        Ok(res) => Outcome::Done(res),
                        Err(payload) => {
                            error!("task panicked: {}", panic_message(&*payload));
                            Outcome::Done(Err(Fault::Task(errors::TASK_PANICKED)))
                        }
                    },
                    _ = expiry => Outcome::Expired,
                }
            };

            match outcome {
                Outcome::Done(Err(fault))
                    if fault.is_retryable() && self.retry_count < self.retry_max =>
                {
                    self.retry_count += 1;
                    self.resp = K::Response::default();
                    debug!(
                        task = self.id.as_u64(),
                        attempt = self.retry_count,
                        ?fault,
                        "retrying task"
                    );
                }
                outcome => break outcome,
            }
        };

        self.apply(outcome);
        trace!(task = self.id.as_u64(), state = %self.state, "task finished");

        K::on_complete(self);

        if let Some(callback) = self.callback.take()
            && let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self)))
        {
            error!(task = self.id.as_u64(), "task callback panicked: {}", panic_message(&*payload));
        }

        self.series = None;
    }
}

enum Outcome {
    Done(Result<(), Fault>),
    Expired,
    Aborted,
}

impl<K: TaskKind> super::sealed::Sealed for Task<K> {}

impl<K: TaskKind> Work for Task<K> {
    fn run<'a>(self: Box<Self>, series: &'a Series, handle: &'a Handle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut task = *self;
            task.run_in(series, handle).await;
        })
    }
}

impl<K> fmt::Debug for Task<K>
where
    K: TaskKind + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("timeout_reason", &self.timeout_reason)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// The series running `task`.
///
/// # Panics
///
/// If the task is not running, i.e. outside of its I/O step and callback.
#[track_caller]
pub fn series_of<K: TaskKind>(task: &Task<K>) -> &Series {
    match task.series() {
        Some(series) => series,
        None => panic!("series_of called on task {} which is not running", task.id),
    }
}
