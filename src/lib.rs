//! Single-threaded cooperative async runtime core.
//!
//! A [`LocalLoop`] drives coroutines (plain Rust `async` blocks returning
//! `Result<T, Error>`) to completion by coordinating them through
//! callback-notifying futures:
//!
//! * [`Future`] is a single-assignment cell: pending, then succeeded or
//!   failed, never backwards. Completion notifies subscribers through the
//!   loop, in FIFO order.
//! * [`Promise`] is the write capability of a plain future.
//! * [`Task`] is a future completed by stepping a coroutine; each step runs
//!   the coroutine until it suspends on another runtime future or finishes.
//! * Cancellation is cooperative: it travels through the chain of awaited
//!   futures and surfaces at an await point as an ordinary
//!   [`Cancelled`] error, which a coroutine may catch.
//! * [`task_group!`] binds a dynamic set of child tasks to a lexical scope:
//!   the scope does not exit until every child finished, and failures are
//!   aggregated into a [`MultiError`] instead of lost.
//!
//! # Example
//!
//! ```rust
//! use strand::{create_promise, create_task, LocalLoop};
//!
//! let lp = LocalLoop::new();
//! let promise = create_promise::<&'static str>(&lp.handle());
//! let fut = promise.future();
//!
//! let task = create_task(async move { fut.await }, &lp.handle());
//! promise.set_result("ready").unwrap();
//! lp.drain();
//!
//! assert_eq!(task.result().unwrap(), "ready");
//! ```

mod error;
mod event_loop;
mod future;
mod future_ext;
mod gather;
mod group;
mod local_loop;
mod promise;
mod task;

pub use self::error::{Cancelled, Error, MultiError};
pub use self::event_loop::{
    EventLoop, Handle, LoopHandle, LoopId, Notifier, RemoteThunk, SchedContext, Thunk,
};
pub use self::future::{Awaited, Callback, Future, FutureId, FutureRef, State};
pub use self::future_ext::{cancel_future, shield};
pub use self::gather::{iter_done, DoneIter};
pub use self::group::{task_group_fn, TaskGroup};
pub use self::local_loop::LocalLoop;
pub use self::promise::{create_promise, create_promise_with, Promise};
pub use self::task::{create_task, create_task_labeled, current_task, Task, TaskRef};

/// Convenience alias for results carrying this runtime's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Opens a task group scope within the current task.
///
/// The scope is not complete until every task spawned in it has finished;
/// child failures are aggregated into a [`MultiError`] rather than lost, and
/// cancelling the surrounding task can never leave a child behind.
///
/// # Example
///
/// ```rust
/// use strand::LocalLoop;
///
/// let lp = LocalLoop::new();
/// let result = lp.block_on(async {
///     strand::task_group!(|group| {
///         let child = group.spawn(async { Ok(21) })?;
///         let doubled = child.await? * 2;
///         Ok(doubled)
///     })
///     .await
/// });
/// assert_eq!(result.unwrap(), 42);
/// ```
#[macro_export]
macro_rules! task_group {
    (|$group:ident| $body:expr) => {{
        $crate::task_group_fn(move |$group| {
            let future = async move { $body };
            ::std::boxed::Box::pin(future)
        })
    }};
}
