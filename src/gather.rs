use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::future::{Callback, Future, FutureCell, FutureRef, Observe};

/// Yields a fixed set of futures in the order they complete.
///
/// Each pending input gets a subscription that enqueues it on a shared queue
/// and wakes the iterator; already-finished inputs are enqueued eagerly. The
/// sequence is finite and not restartable: every input is yielded exactly
/// once. Dropping the iterator removes the remaining subscriptions.
pub struct DoneIter {
    loop_handle: Option<LoopHandle>,
    ready: Rc<RefCell<VecDeque<FutureRef>>>,
    waiter: Rc<RefCell<Option<Rc<FutureCell<()>>>>>,
    subscriptions: Vec<(FutureRef, Callback)>,
    remaining: usize,
}

/// Builds a completion-order iterator over `futures`.
pub fn iter_done(futures: impl IntoIterator<Item = FutureRef>) -> DoneIter {
    let ready: Rc<RefCell<VecDeque<FutureRef>>> = Rc::new(RefCell::new(VecDeque::new()));
    let waiter: Rc<RefCell<Option<Rc<FutureCell<()>>>>> = Rc::new(RefCell::new(None));
    let mut subscriptions = Vec::new();
    let mut remaining = 0;
    let mut loop_handle = None;

    for fut in futures {
        remaining += 1;
        if loop_handle.is_none() {
            loop_handle = Some(fut.0.loop_handle());
        }
        if fut.is_finished() {
            ready.borrow_mut().push_back(fut);
            continue;
        }
        let cb = {
            let ready = Rc::clone(&ready);
            let waiter = Rc::clone(&waiter);
            let fut = fut.clone();
            Callback::new(move || {
                ready.borrow_mut().push_back(fut.clone());
                if let Some(cell) = waiter.borrow_mut().take() {
                    let _ = cell.finish(Ok(()));
                }
            })
        };
        let _ = fut.add_callback(cb.clone());
        subscriptions.push((fut, cb));
    }

    DoneIter { loop_handle, ready, waiter, subscriptions, remaining }
}

impl DoneIter {
    /// The next future to complete, or `None` once every input has been
    /// yielded. A cancellation of the calling task surfaces here as
    /// `Err(Cancelled)`.
    pub async fn next(&mut self) -> Result<Option<FutureRef>, Error> {
        loop {
            if self.remaining == 0 {
                return Ok(None);
            }
            if let Some(fut) = self.ready.borrow_mut().pop_front() {
                self.remaining -= 1;
                self.subscriptions.retain(|(sub, _)| !sub.same(&fut));
                return Ok(Some(fut));
            }

            let Some(loop_handle) = &self.loop_handle else {
                return Err(Error::runtime("completion iterator lost its loop"));
            };
            let cell = FutureCell::new(loop_handle.clone(), Some("iter-done-waiter"), Vec::new());
            *self.waiter.borrow_mut() = Some(Rc::clone(&cell));
            let woken = Future::from_cell(cell as Rc<dyn Observe<()>>).await;
            *self.waiter.borrow_mut() = None;
            woken?;
        }
    }

    /// Inputs not yet yielded.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Drop for DoneIter {
    fn drop(&mut self) {
        for (fut, cb) in &self.subscriptions {
            fut.remove_callback(cb);
        }
        // Settle an armed waiter so it does not count as lost work.
        if let Some(cell) = self.waiter.borrow_mut().take() {
            let _ = cell.finish(Ok(()));
        }
    }
}
