use std::cell::RefCell;
use std::fmt;
use std::future::Future as StdFuture;
use std::rc::{Rc, Weak};
use std::task::Poll;

use futures::future::LocalBoxFuture;

use crate::error::{Cancelled, Error};
use crate::event_loop::LoopHandle;
use crate::future::{Callback, CellOps, Future, FutureCell, FutureId, FutureRef, Observe, State};

type Coro<T> = LocalBoxFuture<'static, Result<T, Error>>;

/// Loop-thread binding of the step currently resuming a coroutine.
///
/// Installed around every coroutine resumption; the await guard uses it to
/// hand the awaited future back to the driver and to pick up an armed
/// inner-cancel, and [`current_task`] reads the task identity from it.
pub(crate) mod step {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::error::{Cancelled, Error};
    use crate::event_loop::LoopHandle;
    use crate::future::FutureRef;

    pub(crate) struct StepCtx {
        pub(crate) task: FutureRef,
        pub(crate) loop_handle: LoopHandle,
        pub(crate) injected: RefCell<Option<Cancelled>>,
        pub(crate) awaited: RefCell<Option<FutureRef>>,
    }

    thread_local! {
        static CURRENT: RefCell<Option<Rc<StepCtx>>> = RefCell::new(None);
    }

    pub(crate) struct StepGuard {
        prev: Option<Rc<StepCtx>>,
    }

    pub(crate) fn install(ctx: Rc<StepCtx>) -> StepGuard {
        let prev = CURRENT.with(|current| current.borrow_mut().replace(ctx));
        StepGuard { prev }
    }

    impl Drop for StepGuard {
        fn drop(&mut self) {
            let prev = self.prev.take();
            CURRENT.with(|current| *current.borrow_mut() = prev);
        }
    }

    pub(crate) fn current() -> Option<Rc<StepCtx>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Consumes an armed inner-cancel, if any. Only the first await poll of
    /// a resumption observes it.
    pub(crate) fn take_injected() -> Option<Cancelled> {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(|ctx| ctx.injected.borrow_mut().take())
        })
    }

    /// Records the future the coroutine just suspended on.
    pub(crate) fn record_await(fut: FutureRef) -> Result<(), Error> {
        CURRENT.with(|current| match &*current.borrow() {
            Some(ctx) => {
                *ctx.awaited.borrow_mut() = Some(fut);
                Ok(())
            }
            None => Err(Error::runtime(
                "runtime future awaited outside of a task step",
            )),
        })
    }
}

/// Coroutine lifecycle alongside the task's future cell.
///
/// `Stepping` marks the coroutine as mid-frame; it is what makes self-cancel
/// detectable. `Done` means the coroutine has been disposed, which happens
/// on completion and on created/scheduled cancellation.
enum Driver<T> {
    Created { coro: Coro<T> },
    Scheduled { coro: Coro<T>, handle: crate::event_loop::Handle },
    Running { coro: Coro<T>, waiting_on: FutureRef },
    Stepping,
    Done,
}

pub(crate) struct TaskCore<T> {
    cell: FutureCell<T>,
    driver: RefCell<Driver<T>>,
    started: Rc<FutureCell<()>>,
    step_cb: Callback,
    /// Keeps the task alive while it is suspended on a pending future, so
    /// that dropping every user handle does not kill a task the loop will
    /// still resume.
    keepalive: RefCell<Option<Rc<TaskCore<T>>>>,
}

impl<T: Clone + 'static> TaskCore<T> {
    fn new(coro: Coro<T>, loop_handle: &LoopHandle, label: Option<&str>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<TaskCore<T>>| {
            let weak = weak.clone();
            let step_cb = Callback::new(move || {
                if let Some(core) = weak.upgrade() {
                    TaskCore::step(&core, None);
                }
            });
            TaskCore {
                cell: FutureCell::raw(
                    loop_handle.clone(),
                    label,
                    vec![("kind", Rc::from("task"))],
                ),
                driver: RefCell::new(Driver::Created { coro }),
                started: FutureCell::new(loop_handle.clone(), Some("task-started"), Vec::new()),
                step_cb,
                keepalive: RefCell::new(None),
            }
        })
    }

    fn schedule_first_step(core: &Rc<Self>) -> Result<(), Error> {
        let mut driver = core.driver.borrow_mut();
        match std::mem::replace(&mut *driver, Driver::Stepping) {
            Driver::Created { coro } => {
                let rc = Rc::clone(core);
                let handle = core.cell.loop_ref().call_soon(
                    Box::new(move || TaskCore::step(&rc, None)),
                    core.cell.context().clone(),
                );
                *driver = Driver::Scheduled { coro, handle };
                Ok(())
            }
            other => {
                *driver = other;
                Err(Error::runtime(
                    "only a newly created task can be scheduled for its first step",
                ))
            }
        }
    }

    /// One coroutine resumption.
    ///
    /// Runs as a loop callback: either the first step, a completion
    /// notification from the awaited future, or an inner-cancel delivery.
    fn step(core: &Rc<Self>, inner_cancel: Option<Cancelled>) {
        let (mut coro, prior) = {
            let mut driver = core.driver.borrow_mut();
            match std::mem::replace(&mut *driver, Driver::Stepping) {
                Driver::Scheduled { coro, .. } => (coro, None),
                Driver::Running { coro, waiting_on } => (coro, Some(waiting_on)),
                other => {
                    *driver = other;
                    tracing::error!(
                        task_id = core.cell.fut_id().raw(),
                        "task resumed in a non-resumable state"
                    );
                    return;
                }
            }
        };

        if let Some(waiting_on) = &prior {
            debug_assert!(
                inner_cancel.is_none() || waiting_on.is_finished(),
                "inner cancel delivered while the awaited future is still pending"
            );
            waiting_on.remove_callback(&core.step_cb);
        }

        let ctx = Rc::new(step::StepCtx {
            task: FutureRef(Rc::clone(core) as Rc<dyn CellOps>),
            loop_handle: core.cell.loop_ref().clone(),
            injected: RefCell::new(inner_cancel),
            awaited: RefCell::new(None),
        });
        let guard = step::install(Rc::clone(&ctx));
        let waker = futures::task::noop_waker();
        let mut poll_cx = std::task::Context::from_waker(&waker);
        let polled = coro.as_mut().poll(&mut poll_cx);
        drop(guard);

        match polled {
            Poll::Ready(outcome) => {
                *core.driver.borrow_mut() = Driver::Done;
                drop(coro);
                core.finish(outcome);
            }
            Poll::Pending => {
                let Some(next) = ctx.awaited.borrow_mut().take() else {
                    *core.driver.borrow_mut() = Driver::Done;
                    drop(coro);
                    core.finish(Err(Error::runtime(
                        "task awaited a future that does not belong to this runtime",
                    )));
                    return;
                };
                if next.id() == core.cell.fut_id() {
                    *core.driver.borrow_mut() = Driver::Done;
                    drop(coro);
                    core.finish(Err(Error::runtime(
                        "task awaiting itself would never complete",
                    )));
                    return;
                }
                if next.0.loop_handle().id() != core.cell.loop_ref().id() {
                    *core.driver.borrow_mut() = Driver::Done;
                    drop(coro);
                    core.finish(Err(Error::runtime(
                        "task awaited a future belonging to another loop",
                    )));
                    return;
                }
                if let Err(err) = next.add_callback(core.step_cb.clone()) {
                    // The guard recorded the future while it was pending and
                    // nothing has run since; this cannot happen.
                    tracing::error!(%err, "subscription on a just-awaited future failed");
                }
                *core.driver.borrow_mut() = Driver::Running { coro, waiting_on: next };
                *core.keepalive.borrow_mut() = Some(Rc::clone(core));
                if !core.started.finished() {
                    let _ = core.started.finish(Ok(()));
                }
            }
        }
    }

    fn finish(&self, outcome: Result<T, Error>) {
        if self.cell.finish(outcome).is_err() {
            tracing::error!(
                task_id = self.cell.fut_id().raw(),
                "task attempted to complete twice"
            );
        }
        if !self.started.finished() {
            let _ = self.started.finish(Ok(()));
        }
        *self.keepalive.borrow_mut() = None;
    }

    /// The cancellation protocol, by current state:
    ///
    /// * created: dispose the coroutine unrun, fail with the cancellation;
    /// * scheduled: revoke the first-step handle, then as created;
    /// * running on a pending future: cancel that future and let its
    ///   completion wake this task;
    /// * running on a finished future: unsubscribe and deliver the
    ///   cancellation into the coroutine at its await point (inner cancel);
    /// * mid-frame: self-cancel, forbidden;
    /// * finished: refused.
    fn cancel_task(&self, reason: Cancelled) -> Result<(), Error> {
        if self.cell.finished() {
            return Err(Error::Finished);
        }

        let mut disposed: Option<Driver<T>> = None;
        let mut awaited: Option<FutureRef> = None;
        {
            let mut driver = self.driver.borrow_mut();
            match &*driver {
                Driver::Stepping => return Err(Error::SelfCancelForbidden),
                Driver::Done => return Err(Error::Finished),
                Driver::Created { .. } | Driver::Scheduled { .. } => {
                    disposed = Some(std::mem::replace(&mut *driver, Driver::Done));
                }
                Driver::Running { waiting_on, .. } => awaited = Some(waiting_on.clone()),
            }
        }

        if let Some(taken) = disposed {
            if let Driver::Scheduled { handle, .. } = &taken {
                debug_assert!(!handle.is_executed());
                handle.cancel();
            }
            // The coroutine goes with `taken`, never having run.
            drop(taken);
            self.finish(Err(Error::Cancelled(reason)));
            return Ok(());
        }

        let Some(waiting_on) = awaited else {
            return Err(Error::runtime("task cancellation reached an impossible state"));
        };
        if !waiting_on.is_finished() {
            waiting_on.0.cancel(reason)
        } else {
            waiting_on.remove_callback(&self.step_cb);
            let Some(rc) = self.keepalive.borrow().clone() else {
                return Err(Error::runtime("running task lost its keepalive"));
            };
            self.cell.loop_ref().call_soon(
                Box::new(move || TaskCore::step(&rc, Some(reason))),
                self.cell.context().clone(),
            );
            Ok(())
        }
    }

    fn task_state(&self) -> State {
        if self.cell.finished() {
            return self.cell.cell_state();
        }
        match &*self.driver.borrow() {
            Driver::Created { .. } => State::Created,
            Driver::Scheduled { .. } => State::Scheduled,
            Driver::Running { .. } | Driver::Stepping => State::Running,
            Driver::Done => self.cell.cell_state(),
        }
    }
}

impl<T: Clone + 'static> CellOps for TaskCore<T> {
    fn id(&self) -> FutureId {
        self.cell.fut_id()
    }

    fn loop_handle(&self) -> LoopHandle {
        self.cell.loop_ref().clone()
    }

    fn label(&self) -> Option<Rc<str>> {
        self.cell.label_ref()
    }

    fn state(&self) -> State {
        self.task_state()
    }

    fn is_finished(&self) -> bool {
        self.cell.finished()
    }

    fn is_cancelled(&self) -> bool {
        self.cell.cancelled()
    }

    fn exception(&self) -> Result<Option<Error>, Error> {
        self.cell.failure()
    }

    fn add_callback(&self, cb: Callback) -> Result<(), Error> {
        self.cell.subscribe(cb)
    }

    fn remove_callback(&self, cb: &Callback) {
        self.cell.unsubscribe(cb)
    }

    fn cancel(&self, reason: Cancelled) -> Result<(), Error> {
        self.cancel_task(reason)
    }
}

impl<T: Clone + 'static> Observe<T> for TaskCore<T> {
    fn try_result(&self) -> Result<T, Error> {
        self.cell.outcome()
    }

    fn erased(self: Rc<Self>) -> FutureRef {
        FutureRef(self)
    }
}

/// A future whose completion is driven by stepping a coroutine.
///
/// Each resumption runs the coroutine until it either finishes, failing or
/// succeeding the task, or suspends on another runtime future, in which case
/// the task subscribes itself and resumes when that future completes.
pub struct Task<T> {
    core: Rc<TaskCore<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self { core: Rc::clone(&self.core) }
    }
}

impl<T: Clone + 'static> Task<T> {
    /// Creates a task without scheduling it; [`Task::start`] enqueues the
    /// first step. Most callers want [`create_task`].
    pub fn new(
        coro: impl StdFuture<Output = Result<T, Error>> + 'static,
        loop_handle: &LoopHandle,
    ) -> Self {
        Self { core: TaskCore::new(Box::pin(coro), loop_handle, None) }
    }

    pub fn new_labeled(
        coro: impl StdFuture<Output = Result<T, Error>> + 'static,
        loop_handle: &LoopHandle,
        label: &str,
    ) -> Self {
        Self { core: TaskCore::new(Box::pin(coro), loop_handle, Some(label)) }
    }

    /// Enqueues the first coroutine step. Fails with a runtime fault unless
    /// the task is still in its created state.
    pub fn start(&self) -> Result<(), Error> {
        TaskCore::schedule_first_step(&self.core)
    }

    pub fn id(&self) -> FutureId {
        self.core.cell.fut_id()
    }

    pub fn label(&self) -> Option<Rc<str>> {
        self.core.cell.label_ref()
    }

    pub fn state(&self) -> State {
        self.core.task_state()
    }

    pub fn is_finished(&self) -> bool {
        self.core.cell.finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cell.cancelled()
    }

    pub fn result(&self) -> Result<T, Error> {
        self.core.cell.outcome()
    }

    pub fn exception(&self) -> Result<Option<Error>, Error> {
        self.core.cell.failure()
    }

    pub fn add_callback(&self, cb: Callback) -> Result<(), Error> {
        self.core.cell.subscribe(cb)
    }

    pub fn remove_callback(&self, cb: &Callback) {
        self.core.cell.unsubscribe(cb)
    }

    /// Requests cooperative cancellation, following the task cancellation
    /// protocol. Fails with [`Error::SelfCancelForbidden`] when invoked from
    /// inside this task's own step and [`Error::Finished`] on a finished
    /// task.
    pub fn cancel(&self, reason: impl Into<Cancelled>) -> Result<(), Error> {
        self.core.cancel_task(reason.into())
    }

    /// This task viewed as a plain future handle.
    pub fn future(&self) -> Future<T> {
        Future::from_cell(Rc::clone(&self.core) as Rc<dyn Observe<T>>)
    }

    pub fn to_ref(&self) -> FutureRef {
        FutureRef(Rc::clone(&self.core) as Rc<dyn CellOps>)
    }

    /// Completed once the task has executed at least one coroutine step, or
    /// finished without ever getting one.
    pub(crate) fn started_future(&self) -> Future<()> {
        Future::from_cell(Rc::clone(&self.core.started) as Rc<dyn Observe<()>>)
    }
}

impl<T: 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.cell.fut_id())
            .field("label", &self.core.cell.label_ref())
            .finish()
    }
}

impl<T: Clone + 'static> std::future::IntoFuture for Task<T> {
    type Output = Result<T, Error>;
    type IntoFuture = crate::future::Awaited<T>;

    fn into_future(self) -> Self::IntoFuture {
        std::future::IntoFuture::into_future(self.future())
    }
}

impl<T: Clone + 'static> std::future::IntoFuture for &Task<T> {
    type Output = Result<T, Error>;
    type IntoFuture = crate::future::Awaited<T>;

    fn into_future(self) -> Self::IntoFuture {
        std::future::IntoFuture::into_future(self.future())
    }
}

/// Type-erased handle to a task, as handed out by [`current_task`].
#[derive(Clone)]
pub struct TaskRef {
    ops: Rc<dyn CellOps>,
}

impl TaskRef {
    pub fn id(&self) -> FutureId {
        self.ops.id()
    }

    pub fn label(&self) -> Option<Rc<str>> {
        self.ops.label()
    }

    pub fn state(&self) -> State {
        self.ops.state()
    }

    pub fn is_finished(&self) -> bool {
        self.ops.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.ops.is_cancelled()
    }

    pub fn cancel(&self, reason: impl Into<Cancelled>) -> Result<(), Error> {
        self.ops.cancel(reason.into())
    }

    pub fn to_ref(&self) -> FutureRef {
        FutureRef(Rc::clone(&self.ops))
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.ops.id())
            .field("state", &self.ops.state())
            .finish()
    }
}

/// Creates a task and schedules its first step.
pub fn create_task<T: Clone + 'static>(
    coro: impl StdFuture<Output = Result<T, Error>> + 'static,
    loop_handle: &LoopHandle,
) -> Task<T> {
    let task = Task::new(coro, loop_handle);
    if let Err(err) = task.start() {
        tracing::error!(%err, "freshly created task failed to schedule");
    }
    task
}

/// [`create_task`] with a label for diagnostics and scheduling context.
pub fn create_task_labeled<T: Clone + 'static>(
    coro: impl StdFuture<Output = Result<T, Error>> + 'static,
    loop_handle: &LoopHandle,
    label: &str,
) -> Task<T> {
    let task = Task::new_labeled(coro, loop_handle, label);
    if let Err(err) = task.start() {
        tracing::error!(%err, "freshly created task failed to schedule");
    }
    task
}

/// The task currently being resumed. Fails with a runtime fault outside a
/// task step.
pub fn current_task() -> Result<TaskRef, Error> {
    step::current()
        .map(|ctx| TaskRef { ops: Rc::clone(&ctx.task.0) })
        .ok_or_else(|| Error::runtime("no task is currently being resumed"))
}

/// The loop driving the current task step.
pub(crate) fn current_loop() -> Result<LoopHandle, Error> {
    step::current()
        .map(|ctx| ctx.loop_handle.clone())
        .ok_or_else(|| Error::runtime("no task is currently being resumed"))
}
