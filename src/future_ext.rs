use std::rc::Rc;

use crate::error::{Cancelled, Error};
use crate::future::{Callback, Future, FutureCell, Observe};

/// Cancels a future or task through a shared handle, dispatching by kind: a
/// plain future simply fails with the cancellation, a task runs the task
/// cancellation protocol. Fails with [`Error::Finished`] on a terminal
/// target.
pub fn cancel_future<T: Clone + 'static>(
    fut: &Future<T>,
    reason: impl Into<Cancelled>,
) -> Result<(), Error> {
    fut.cell.cancel(reason.into())
}

/// Returns a future mirroring `fut` without being cancellable through to it:
/// cancelling the mirror never touches `fut`, and a task awaiting the mirror
/// can be cancelled while `fut` keeps running. The task group join phase is
/// isolated with exactly this.
pub fn shield<T: Clone + 'static>(fut: &Future<T>) -> Future<T> {
    let mirror = FutureCell::new(fut.loop_handle(), Some("shield"), Vec::new());

    if fut.is_finished() {
        let _ = mirror.finish(fut.result());
    } else {
        let source = fut.clone();
        let target = Rc::clone(&mirror);
        let forward = Callback::new(move || {
            // The mirror may have been cancelled in the meantime; a late
            // completion from the source is dropped on the floor then.
            let _ = target.finish(source.result());
        });
        if fut.add_callback(forward).is_err() {
            // Completed between the check and the registration; cannot
            // happen on the loop thread, but stay total.
            let _ = mirror.finish(fut.result());
        }
    }

    Future::from_cell(mirror as Rc<dyn Observe<T>>)
}
