use std::fmt;
use std::rc::Rc;

use crate::error::{Cancelled, Error};
use crate::event_loop::LoopHandle;
use crate::future::{Future, FutureCell, Observe};

/// Write capability of a plain future.
///
/// Exactly one transition is permitted over the lifetime of the cell; every
/// operation after it fails with [`Error::Finished`]. There is no promise
/// over a task: tasks complete themselves, and [`create_promise`] is the
/// only constructor.
pub struct Promise<T> {
    cell: Rc<FutureCell<T>>,
}

impl<T: Clone + 'static> Promise<T> {
    pub fn set_result(&self, value: T) -> Result<(), Error> {
        self.cell.finish(Ok(value))
    }

    /// Stores a failure. A [`Cancelled`] is refused here; cancellation must
    /// go through [`Promise::cancel`] so the intent stays explicit.
    pub fn set_exception(&self, exc: Error) -> Result<(), Error> {
        if matches!(exc, Error::Cancelled(_)) {
            return Err(Error::runtime(
                "use the cancellation API instead of passing a Cancelled error manually",
            ));
        }
        self.cell.finish(Err(exc))
    }

    /// Fails the future with a cancellation. The reason coerces: a message
    /// becomes a fresh `Cancelled` carrying it, an existing `Cancelled` is
    /// used as-is.
    pub fn cancel(&self, reason: impl Into<Cancelled>) -> Result<(), Error> {
        self.cell.finish(Err(Error::Cancelled(reason.into())))
    }

    /// A fresh read handle on the underlying future.
    pub fn future(&self) -> Future<T> {
        Future::from_cell(Rc::clone(&self.cell) as Rc<dyn Observe<T>>)
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// Creates an unlabeled promise/future pair on the given loop.
pub fn create_promise<T: Clone + 'static>(loop_handle: &LoopHandle) -> Promise<T> {
    Promise { cell: FutureCell::new(loop_handle.clone(), None, Vec::new()) }
}

/// Creates a labeled promise/future pair; `extra` key/value pairs travel in
/// the scheduling context of every completion callback.
pub fn create_promise_with<T: Clone + 'static>(
    loop_handle: &LoopHandle,
    label: &str,
    extra: impl IntoIterator<Item = (&'static str, String)>,
) -> Promise<T> {
    let extra = extra.into_iter().map(|(k, v)| (k, Rc::from(v))).collect();
    Promise { cell: FutureCell::new(loop_handle.clone(), Some(label), extra) }
}
