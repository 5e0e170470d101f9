#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry point attributes for skein.

mod entry;
mod parse;

/// Runs a function inside a freshly built engine.
///
/// The body is a plain (non-`async`) function: it starts tasks, series and
/// parallels, then returns. The generated `main` waits until all of them have
/// drained, shuts the engine down and returns the body's value.
///
/// # Knobs
///
/// - `worker_threads`: threads polling series. Defaults to one per core.
/// - `compute_threads`: threads running go tasks, file I/O and name
///   resolution. Defaults to 4.
///
/// # Usage
///
/// ```ignore
/// #[skein::main(worker_threads = 2)]
/// fn main() {
///     skein::create_timer_task(std::time::Duration::from_millis(10), |task| {
///         println!("timer done: {}", task.state());
///     })
///     .start();
/// }
/// ```
///
/// Equivalent code not using `#[skein::main]`
///
/// ```ignore
/// fn main() {
///     let engine = skein::Builder::new()
///         .worker_threads(2)
///         .try_build()
///         .expect("Failed building the Engine");
///
///     engine.enter(|| {
///         skein::create_timer_task(std::time::Duration::from_millis(10), |_| {}).start();
///     });
///     engine.wait_finish();
///     engine.shutdown();
/// }
/// ```
#[proc_macro_attribute]
pub fn main(args: proc_macro::TokenStream, item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Like [`main`](macro@main), for tests. Each test gets its own engine.
///
/// ```ignore
/// #[skein::test(worker_threads = 2)]
/// fn timer_fires() {
///     skein::create_timer_task(std::time::Duration::from_millis(1), |task| {
///         assert_eq!(task.state(), skein::State::Success);
///     })
///     .start();
/// }
/// ```
///
/// Returning `anyhow::Result<()>` (or any other `Result`) works as with a
/// plain `#[test]`. The engine is drained before the result is returned.
#[proc_macro_attribute]
pub fn test(args: proc_macro::TokenStream, item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
