use crate::runtime::Handle;
use crate::task::{Fault, Task, TaskKind};
use futures::future::{self, BoxFuture, FutureExt};

/// Completes immediately with [`State::Success`](crate::State::Success).
/// Handy as a series head or a placeholder.
#[derive(Debug, Default, Clone, Copy)]
pub struct Empty;

impl TaskKind for Empty {
    type Request = ();
    type Response = ();

    fn execute<'a>(_task: &'a mut Task<Self>, _handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>> {
        future::ready(Ok(())).boxed()
    }
}
