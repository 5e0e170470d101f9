//! Callback-driven task graphs.
//!
//! A [`Task`] is one unit of asynchronous work with a callback. Tasks run in
//! order inside a [`Series`]; a [`Parallel`] runs several series at once and
//! can itself sit inside a series. Callbacks may extend the graph while it
//! runs:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! #[skein::main]
//! fn main() -> anyhow::Result<()> {
//!     skein::create_http_task("http://example.com/", 3, 1, |task| {
//!         println!("{} {}", task.state(), task.resp().status);
//!
//!         let pause = skein::create_timer_task(Duration::from_millis(10), |_| {});
//!         skein::series_of(task).push_back(pause);
//!     })?
//!     .start();
//!     Ok(())
//! }
//! ```

#[doc(inline)]
pub use skein_macros::main;

#[doc(inline)]
pub use skein_macros::test;

mod context;

pub mod error;
pub use error::{Error, Result};

mod facilities;
pub use facilities::WaitGroup;

pub mod protocol;

pub(crate) mod reactor;

pub mod runtime;
pub use runtime::{Builder, EndpointParams, Engine, Handle, init};

pub mod server;
pub use server::{
    HttpServer, RedisServer, Rejection, Reply, Server, ServerParams, ServerProtocol, ServerTask,
};

pub mod task;
pub use task::factory::*;
pub use task::kinds::count_by_name;
pub use task::{
    ContextSlot, Fault, Parallel, Series, State, Task, TaskKind, TimeoutReason, Work,
    create_parallel_work, error_string, errors, series_of, start_parallel_work,
};

mod utils;

#[cfg(test)]
mod test_utils;

/// Blocks until every series started on the current engine has finished.
///
/// # Panics
///
/// On one of the engine's own worker threads.
pub fn wait_finish() {
    Handle::current().wait_finish();
}

/// Like [`wait_finish`], giving up after `timeout`. Returns `false` if work
/// was still outstanding.
pub fn wait_finish_timeout(timeout: std::time::Duration) -> bool {
    Handle::current().wait_finish_timeout(timeout)
}
