use async_task::Runnable;

// Public API
pub mod builder;
pub use builder::{Builder, EndpointParams};

mod engine;
pub use engine::{Engine, Handle};

mod global;
pub use global::init;

// Exports
pub(crate) use builder::EngineConfig;

pub(crate) mod blocking;

pub(crate) mod cancel;

pub(crate) mod outstanding;

mod pool;

mod ticker;

pub(crate) mod worker;

/// Scheduler trait
pub(crate) trait Schedule: Send + Sync + 'static {
    /// Queue a runnable to be polled soon. Called by the waker of every
    /// future spawned on the engine.
    fn schedule(&self, runnable: Runnable);
}

/// Abstraction of everything needed to build an event loop.
pub(crate) trait EventLoop {
    type Task;

    fn add_task(&self, task: Self::Task);

    fn find_task(&self) -> Option<Self::Task>;

    /// Runs until the engine shuts down.
    //
    // Can't do &mut because scheduling from inside a polled future needs
    // access to the worker. Worker needs interior mutability.
    fn event_loop(&self);
}
