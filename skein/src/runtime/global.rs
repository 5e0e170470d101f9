use crate::context;
use crate::error::{Error, Result};
use crate::runtime::{Builder, Engine, Handle};
use std::sync::OnceLock;
use tracing::debug;

/// Process-wide engine used when no other engine is current on the thread.
static GLOBAL: OnceLock<Engine> = OnceLock::new();

/// Configures the global engine. Must run before anything uses it, the
/// default configuration is applied lazily otherwise.
///
/// ```no_run
/// skein::init(skein::Builder::new().worker_threads(8).compute_threads(2))?;
/// # Ok::<(), skein::Error>(())
/// ```
pub fn init(builder: Builder) -> Result<()> {
    if GLOBAL.get().is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let engine = builder.try_build()?;
    GLOBAL.set(engine).map_err(|engine| {
        // Lost the race against a lazy initialization.
        engine.shutdown();
        Error::AlreadyInitialized
    })
}

fn global() -> &'static Engine {
    GLOBAL.get_or_init(|| {
        debug!("building global engine with default configuration");
        match Builder::new().try_build() {
            Ok(engine) => engine,
            Err(e) => panic!("failed to build the global engine: {:#}", e),
        }
    })
}

pub(crate) fn current_handle() -> Handle {
    context::current().unwrap_or_else(|| global().handle().clone())
}
