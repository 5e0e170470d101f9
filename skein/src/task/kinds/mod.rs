//! Built-in task kinds. Network kinds live in [`crate::protocol`], the server
//! task in [`crate::server`].

use crate::runtime::Handle;
use crate::runtime::worker::panic_message;
use crate::task::{Fault, errors};
use std::io;
use tracing::error;

mod counter;
pub use counter::{Counter, CounterHandle, count_by_name};

mod empty;
pub use empty::Empty;

mod file;
pub use file::{FileSource, Pread, PreadRequest, Pwrite, PwriteRequest};

mod go;
pub use go::{Go, GoFn};

mod timer;
pub use timer::Timer;

/// Runs `f` on a compute thread and maps its outcome to a [`Fault`].
pub(crate) async fn blocking_io<F, R>(handle: &Handle, f: F) -> Result<R, Fault>
where
    F: FnOnce() -> io::Result<R> + Send + 'static,
    R: Send + 'static,
{
    match handle.blocking().spawn(f).await {
        Ok(Ok(res)) => res.map_err(Fault::from),
        Ok(Err(payload)) => {
            error!("blocking job panicked: {}", panic_message(&*payload));
            Err(Fault::Task(errors::TASK_PANICKED))
        }
        // The pool shut down before running the job.
        Err(_) => Err(Fault::Sys(libc::ECANCELED)),
    }
}
