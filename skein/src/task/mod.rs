use crate::runtime::Handle;
use futures::future::BoxFuture;

// Public API
pub mod context;
pub use self::context::ContextSlot;

pub mod factory;

pub mod id;
pub use self::id::Id;

pub mod kinds;

mod parallel;
pub use self::parallel::{Parallel, create_parallel_work, start_parallel_work};

pub(crate) mod series;
pub use self::series::Series;

pub mod state;
pub use self::state::{State, TimeoutReason, error_string, errors};

#[allow(clippy::module_inception)]
mod task;
pub use self::task::{Fault, Task, TaskKind, series_of};

mod sealed {
    pub trait Sealed {}
}

/// Anything a series can hold: a [`Task`] of any kind or a [`Parallel`].
pub trait Work: sealed::Sealed + Send + 'static {
    /// Runs to completion, callbacks included.
    #[doc(hidden)]
    fn run<'a>(self: Box<Self>, series: &'a Series, handle: &'a Handle) -> BoxFuture<'a, ()>;
}

#[cfg(test)]
mod tests;
