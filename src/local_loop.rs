use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future as StdFuture;
use std::rc::Rc;

use crate::error::Error;
use crate::event_loop::{EventLoop, Handle, LoopHandle, LoopId, Notifier, RemoteThunk, SchedContext, Thunk};
use crate::task::{create_task, Task};

struct Scheduled {
    thunk: Thunk,
    handle: Handle,
    context: SchedContext,
}

/// A ready-queue-only loop driver.
///
/// It has no reactor and no timers: callbacks become ready the moment they
/// are submitted, either from the loop thread through `call_soon` or from
/// another thread through a [`Notifier`]. That is all the runtime core
/// needs, and all the crate's own tests use.
///
/// Ordering: the ready queue is strict FIFO, so if callback A is enqueued
/// before callback C, A runs before C regardless of who enqueued them.
pub struct LocalLoop {
    core: Rc<LoopCore>,
}

struct LoopCore {
    id: LoopId,
    ready: RefCell<VecDeque<Scheduled>>,
    draining: Cell<bool>,
    remote_tx: async_channel::Sender<RemoteThunk>,
    remote_rx: async_channel::Receiver<RemoteThunk>,
}

impl EventLoop for LoopCore {
    fn call_soon(&self, thunk: Thunk, context: SchedContext) -> Handle {
        let handle = Handle::new();
        self.ready.borrow_mut().push_back(Scheduled {
            thunk,
            handle: handle.clone(),
            context,
        });
        handle
    }

    fn notifier(&self) -> Notifier {
        Notifier::new(self.remote_tx.clone())
    }

    fn id(&self) -> LoopId {
        self.id
    }
}

impl LocalLoop {
    pub fn new() -> Self {
        let (remote_tx, remote_rx) = async_channel::unbounded();
        Self {
            core: Rc::new(LoopCore {
                id: LoopId::fresh(),
                ready: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
                remote_tx,
                remote_rx,
            }),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(Rc::clone(&self.core) as Rc<dyn EventLoop>)
    }

    pub fn notifier(&self) -> Notifier {
        self.core.notifier()
    }

    /// Moves thread-injected work onto the ready queue.
    fn pump_remote(&self) {
        while let Ok(thunk) = self.core.remote_rx.try_recv() {
            let context = SchedContext {
                future_id: 0,
                future_label: Some(Rc::from("thread-safe")),
                extra: Vec::new(),
            };
            let _ = self.core.call_soon(thunk, context);
        }
    }

    /// Executes the ready queue to quiescence, including callbacks enqueued
    /// by the callbacks themselves. Revoked handles are skipped; executed
    /// ones are marked through their handle.
    ///
    /// A callback must never drive the loop; a reentrant drain is refused.
    pub fn drain(&self) {
        if self.core.draining.get() {
            tracing::error!("loop drain re-entered from a callback; refusing");
            return;
        }
        self.core.draining.set(true);
        loop {
            self.pump_remote();
            let next = self.core.ready.borrow_mut().pop_front();
            let Some(entry) = next else { break };
            if entry.handle.is_cancelled() {
                continue;
            }
            let span = entry.context.span();
            let _guard = span.enter();
            (entry.thunk)();
            entry.handle.mark_executed();
        }
        self.core.draining.set(false);
    }

    /// Drives the loop until `task` finishes, parking on the cross-thread
    /// queue whenever the ready queue runs dry. Deadlocks if nothing will
    /// ever wake the loop, like any driver without a reactor.
    pub fn run_until<T: Clone + 'static>(&self, task: &Task<T>) -> Result<T, Error> {
        loop {
            self.drain();
            if task.is_finished() {
                return task.result();
            }
            match futures::executor::block_on(self.core.remote_rx.recv()) {
                Ok(thunk) => {
                    let context = SchedContext {
                        future_id: 0,
                        future_label: Some(Rc::from("thread-safe")),
                        extra: Vec::new(),
                    };
                    let _ = self.core.call_soon(thunk, context);
                }
                Err(_) => return Err(Error::runtime("event loop queue closed while parked")),
            }
        }
    }

    /// Spawns `coro` as a task and drives the loop until it finishes.
    pub fn block_on<T: Clone + 'static>(
        &self,
        coro: impl StdFuture<Output = Result<T, Error>> + 'static,
    ) -> Result<T, Error> {
        let task = create_task(coro, &self.handle());
        self.run_until(&task)
    }
}

impl Default for LocalLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn journal() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn ready_queue_is_fifo() {
        let lp = LocalLoop::new();
        let handle = lp.handle();
        let log = journal();

        for name in ["first", "second", "third"] {
            let log = Rc::clone(&log);
            handle.call_soon(Box::new(move || log.borrow_mut().push(name)), SchedContext::default());
        }
        lp.drain();

        assert_eq!(*log.borrow(), ["first", "second", "third"]);
    }

    #[test]
    fn callback_enqueued_by_callback_runs_after_already_queued_work() {
        let lp = LocalLoop::new();
        let handle = lp.handle();
        let log = journal();

        {
            let log = Rc::clone(&log);
            let inner_handle = handle.clone();
            handle.call_soon(
                Box::new(move || {
                    log.borrow_mut().push("a");
                    let log = Rc::clone(&log);
                    inner_handle.call_soon(
                        Box::new(move || log.borrow_mut().push("b")),
                        SchedContext::default(),
                    );
                }),
                SchedContext::default(),
            );
        }
        {
            let log = Rc::clone(&log);
            handle.call_soon(Box::new(move || log.borrow_mut().push("c")), SchedContext::default());
        }
        lp.drain();

        // "b" was enqueued while "c" already waited, so it runs after it.
        assert_eq!(*log.borrow(), ["a", "c", "b"]);
    }

    #[test]
    fn cancelled_handle_is_skipped_and_never_marked_executed() {
        let lp = LocalLoop::new();
        let log = journal();

        let handle = {
            let log = Rc::clone(&log);
            lp.handle()
                .call_soon(Box::new(move || log.borrow_mut().push("ran")), SchedContext::default())
        };
        handle.cancel();
        lp.drain();

        assert!(log.borrow().is_empty());
        assert!(!handle.is_executed());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn executed_flag_is_observable_after_drain() {
        let lp = LocalLoop::new();
        let handle = lp.handle().call_soon(Box::new(|| {}), SchedContext::default());
        assert!(!handle.is_executed());
        lp.drain();
        assert!(handle.is_executed());
    }

    #[test]
    fn notifier_injects_work_from_another_thread() {
        let lp = LocalLoop::new();
        let notifier = lp.notifier();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<&'static str>();

        let worker = std::thread::spawn(move || {
            notifier
                .call_soon_threadsafe(move || {
                    done_tx.send("from-thread").ok();
                })
                .ok();
        });
        worker.join().ok();
        lp.drain();

        assert_eq!(done_rx.try_recv().ok(), Some("from-thread"));
    }
}
