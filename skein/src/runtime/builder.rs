use crate::runtime::Engine;
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// Threads dedicated to go tasks, file I/O and name resolution.
const COMPUTE_THREADS: usize = 4;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn(prefix: &'static str) -> ThreadNameFn {
    let count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = count.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", prefix, id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Defaults applied to every outgoing network task. Per-task setters
/// (`set_connect_timeout`, `set_receive_timeout`, ...) take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointParams {
    /// Upper bound on name resolution plus TCP connect. `None` waits forever.
    pub connect_timeout: Option<Duration>,

    /// Upper bound on every single read while waiting for a response.
    pub response_timeout: Option<Duration>,

    /// Responses growing past this size fail with
    /// [`errors::RESPONSE_TOO_LARGE`](crate::errors::RESPONSE_TOO_LARGE).
    pub max_response_size: usize,
}

impl Default for EndpointParams {
    fn default() -> Self {
        Self {
            connect_timeout: Some(CONNECT_TIMEOUT),
            response_timeout: Some(RESPONSE_TIMEOUT),
            max_response_size: MAX_RESPONSE_SIZE,
        }
    }
}

#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads polling series. Defaults to 1 per core.
    worker_threads: Option<usize>,

    /// Threads running go tasks, file reads/writes and DNS lookups.
    compute_threads: usize,

    /// Name fn used for worker threads.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the engine.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling work from the global injector queue.
    global_queue_interval: u32,

    /// How many times a worker will loop over the global injector queue and
    /// other stealable queues to try and find work before parking.
    max_steal_retries: usize,

    endpoint_params: EndpointParams,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            compute_threads: COMPUTE_THREADS,
            thread_name: default_thread_name_fn("skein"),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            endpoint_params: EndpointParams::default(),
        }
    }

    /// The number of worker threads driving series and parallels.
    ///
    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// The number of threads running blocking work: go task closures, file
    /// reads/writes and name resolution. Defaults to 4.
    #[track_caller]
    pub fn compute_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "compute_threads must be greater than 0");
        self.compute_threads = val;
        self
    }

    /// Sets name of worker threads.
    ///
    /// The default name is "skein-{id}", where id is monotonically
    /// increasing. Names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of worker threads.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for threads spawned by the engine.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of scheduler ticks after which a worker will poll the
    /// global queue before its own local queue.
    ///
    /// Setting the interval to a smaller value makes newly started series get
    /// picked up sooner, at the cost of more synchronization overhead.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    pub fn endpoint_params(mut self, params: EndpointParams) -> Self {
        self.endpoint_params = params;
        self
    }

    /// Creates the configured `Engine`. Worker threads are running when this
    /// returns.
    pub fn try_build(self) -> Result<Engine> {
        let cfg = EngineConfig::try_from(self)?;
        Engine::new(cfg)
    }
}

/// Builder exported as a config object, shared by the workers and task kinds.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub(crate) worker_threads: usize,
    pub(crate) compute_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) compute_thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) endpoint_params: EndpointParams,
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.endpoint_params.connect_timeout
            && timeout.is_zero()
        {
            return Err(anyhow!("connect_timeout must be greater than 0"));
        }

        if let Some(timeout) = self.endpoint_params.response_timeout
            && timeout.is_zero()
        {
            return Err(anyhow!("response_timeout must be greater than 0"));
        }

        if self.endpoint_params.max_response_size == 0 {
            return Err(anyhow!("max_response_size must be greater than 0"));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for EngineConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = EngineConfig {
            worker_threads,
            compute_threads: builder.compute_threads,
            thread_name: builder.thread_name,
            compute_thread_name: default_thread_name_fn("skein-compute"),
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
            endpoint_params: builder.endpoint_params,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(EngineConfig: Send, Sync, Clone);

    #[test]
    fn test_default_names_increase() -> Result<()> {
        let cfg = EngineConfig::try_from(Builder::new().worker_threads(2))?;

        assert_eq!(cfg.thread_name.0(), "skein-0");
        assert_eq!(cfg.thread_name.0(), "skein-1");
        assert_eq!(cfg.compute_thread_name.0(), "skein-compute-0");
        Ok(())
    }

    #[rstest]
    #[case::zero_connect(EndpointParams { connect_timeout: Some(Duration::ZERO), ..Default::default() })]
    #[case::zero_response(EndpointParams { response_timeout: Some(Duration::ZERO), ..Default::default() })]
    #[case::zero_size(EndpointParams { max_response_size: 0, ..Default::default() })]
    fn test_invalid_endpoint_params(#[case] params: EndpointParams) {
        let res = EngineConfig::try_from(Builder::new().endpoint_params(params));
        assert!(res.is_err());
    }

    #[test]
    #[should_panic(expected = "worker_threads must be greater than 0")]
    fn test_zero_workers_panics() {
        let _ = Builder::new().worker_threads(0);
    }
}
