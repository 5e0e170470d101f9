use crate::runtime::Handle;
use crate::runtime::worker::panic_message;
use crate::task::{Fault, Task, TaskKind, errors};
use futures::future::{self, BoxFuture, FutureExt};
use std::fmt;
use std::marker::PhantomData;
use tracing::warn;

pub type GoFn<R> = Box<dyn FnOnce() -> R + Send>;

/// Runs a closure on a compute thread. The response holds its return value.
///
/// The closure may block; workers never run it.
pub struct Go<R> {
    name: String,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Go<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<R> fmt::Debug for Go<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Go").field("name", &self.name).finish()
    }
}

impl<R: Send + 'static> TaskKind for Go<R> {
    type Request = Option<GoFn<R>>;
    type Response = Option<R>;

    fn execute<'a>(task: &'a mut Task<Self>, handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>> {
        // A retry after the pool refused the job has nothing left to run.
        let Some(f) = task.req.take() else {
            return future::ready(Err(Fault::Sys(libc::ECANCELED))).boxed();
        };

        let rx = handle.blocking().spawn(f);

        Box::pin(async move {
            match rx.await {
                Ok(Ok(out)) => {
                    task.resp = Some(out);
                    Ok(())
                }
                Ok(Err(payload)) => {
                    warn!(
                        name = %task.kind.name,
                        "go task panicked: {}",
                        panic_message(&*payload)
                    );
                    Err(Fault::Task(errors::GO_PANICKED))
                }
                Err(_) => Err(Fault::Sys(libc::ECANCELED)),
            }
        })
    }
}

impl<R: Send + 'static> Task<Go<R>> {
    pub fn name(&self) -> &str {
        &self.kind.name
    }
}
