use crate::reactor::time::Sleep;
use crate::runtime::Handle;
use crate::task::{Fault, Task, TaskKind};
use futures::future::BoxFuture;
use std::time::Duration;

/// Completes once its duration elapsed. The request is the duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timer;

impl TaskKind for Timer {
    type Request = Duration;
    type Response = ();

    fn execute<'a>(task: &'a mut Task<Self>, handle: &'a Handle) -> BoxFuture<'a, Result<(), Fault>> {
        let duration = task.req;
        Box::pin(async move {
            Sleep::new(handle.reactor(), duration).await;
            Ok(())
        })
    }
}
