//! Constructors for the built-in task kinds.
//!
//! Every factory returns a task that has not started yet: set its callback,
//! deadline or user data, then [`Task::start`] it or push it into a
//! [`Series`](crate::Series).

use crate::error::{Error, Result};
use crate::protocol::{Client, Http, Protocol, Redis, Uri};
use crate::task::kinds::{
    Counter, Empty, FileSource, Go, GoFn, Pread, PreadRequest, Pwrite, PwriteRequest, Timer,
};
use crate::task::{Task, TaskKind};
use std::time::Duration;

pub use crate::protocol::{HttpTask, RedisTask};

pub type TimerTask = Task<Timer>;
pub type GoTask<R> = Task<Go<R>>;
pub type CounterTask = Task<Counter>;
pub type EmptyTask = Task<Empty>;
pub type PreadTask = Task<Pread>;
pub type PwriteTask = Task<Pwrite>;

fn with_callback<K, F>(mut task: Task<K>, callback: F) -> Task<K>
where
    K: TaskKind,
    F: FnOnce(&mut Task<K>) + Send + 'static,
{
    task.set_callback(callback);
    task
}

pub fn create_timer_task<F>(duration: Duration, callback: F) -> TimerTask
where
    F: FnOnce(&mut TimerTask) + Send + 'static,
{
    with_callback(Task::new(Timer, duration), callback)
}

/// Runs `f` on a compute thread. Its return value is the task's response.
pub fn create_go_task<R, G, F>(name: impl Into<String>, f: G, callback: F) -> GoTask<R>
where
    R: Send + 'static,
    G: FnOnce() -> R + Send + 'static,
    F: FnOnce(&mut GoTask<R>) + Send + 'static,
{
    let f: GoFn<R> = Box::new(f);
    with_callback(Task::new(Go::<R>::new(name), Some(f)), callback)
}

pub fn create_empty_task() -> EmptyTask {
    Task::new(Empty, ())
}

/// A task completing after being counted `target` times. Named counters can
/// be counted with [`count_by_name`](crate::count_by_name); a zero target
/// completes as soon as the task runs.
pub fn create_counter_task<F>(name: Option<&str>, target: u32, callback: F) -> CounterTask
where
    F: FnOnce(&mut CounterTask) + Send + 'static,
{
    with_callback(Task::new(Counter::new(name.map(str::to_owned), target), ()), callback)
}

pub fn create_pread_task<F>(file: impl Into<FileSource>, count: usize, offset: u64, callback: F) -> PreadTask
where
    F: FnOnce(&mut PreadTask) + Send + 'static,
{
    let req = PreadRequest {
        file: file.into(),
        offset,
        count,
    };
    with_callback(Task::new(Pread, req), callback)
}

pub fn create_pwrite_task<F>(
    file: impl Into<FileSource>,
    data: impl Into<Vec<u8>>,
    offset: u64,
    callback: F,
) -> PwriteTask
where
    F: FnOnce(&mut PwriteTask) + Send + 'static,
{
    let req = PwriteRequest {
        file: file.into(),
        offset,
        data: data.into(),
    };
    with_callback(Task::new(Pwrite, req), callback)
}

/// A client task for `P` with a default request aimed at `url`.
pub fn create_client_task<P, F>(url: &str, retry_max: u32, callback: F) -> Result<Task<Client<P>>>
where
    P: Protocol,
    P::Request: Default,
    F: FnOnce(&mut Task<Client<P>>) + Send + 'static,
{
    let uri = Uri::parse(url)?;
    if uri.scheme() != P::SCHEME {
        return Err(Error::UnsupportedScheme(uri.scheme().to_owned()));
    }

    let mut req = P::Request::default();
    P::prepare(&mut req, &uri);

    let mut task = Task::new(Client::new(uri), req);
    task.set_retry_max(retry_max);
    Ok(with_callback(task, callback))
}

/// A `GET url` task. Set a different method, headers or body through
/// [`Task::req_mut`] before starting it.
///
/// # Errors
///
/// When `url` does not parse or is not `http://`.
pub fn create_http_task<F>(url: &str, redirect_max: u32, retry_max: u32, callback: F) -> Result<HttpTask>
where
    F: FnOnce(&mut HttpTask) + Send + 'static,
{
    let mut task = create_client_task::<Http, _>(url, retry_max, callback)?;
    task.set_redirect_max(redirect_max);
    Ok(task)
}

/// A redis task. Its command must be set through [`Task::req_mut`] (see
/// [`RedisRequest::set_request`](crate::protocol::RedisRequest::set_request)) before starting it.
///
/// # Errors
///
/// When `url` does not parse or is not `redis://`.
pub fn create_redis_task<F>(url: &str, retry_max: u32, callback: F) -> Result<RedisTask>
where
    F: FnOnce(&mut RedisTask) + Send + 'static,
{
    create_client_task::<Redis, _>(url, retry_max, callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use static_assertions::assert_impl_all;

    assert_impl_all!(HttpTask: Send);
    assert_impl_all!(TimerTask: Send);
    assert_impl_all!(GoTask<Vec<u8>>: Send);

    #[test]
    fn test_http_task_targets_url() -> anyhow::Result<()> {
        let task = create_http_task("http://example.com:8080/a?b", 3, 1, |_| {})?;
        assert_eq!(task.uri().port(), 8080);
        assert_eq!(task.req().target, "/a?b");
        assert_eq!(task.req().method, "GET");
        assert_eq!(task.state(), State::Pending);
        Ok(())
    }

    #[test]
    fn test_http_task_rejects_other_schemes() {
        assert!(matches!(
            create_http_task("redis://127.0.0.1/", 0, 0, |_| {}),
            Err(Error::UnsupportedScheme(_))
        ));
        assert!(matches!(
            create_http_task("https://example.com/", 0, 0, |_| {}),
            Err(Error::UnsupportedScheme(_))
        ));
        assert!(matches!(
            create_http_task("not a url", 0, 0, |_| {}),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_redis_task_defaults_to_ping() -> anyhow::Result<()> {
        let task = create_redis_task("redis://127.0.0.1:6380/", 0, |_| {})?;
        assert_eq!(task.req().command(), "PING");
        Ok(())
    }

    #[test]
    fn test_counter_task_target() {
        let task = create_counter_task(None, 3, |_| {});
        assert_eq!(task.target(), 3);
    }
}
