use std::cell::{Cell, RefCell};
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;

use crate::error::{Cancelled, Error};
use crate::event_loop::{Handle, LoopHandle, SchedContext};
use crate::task::step;

/// Process-wide unique id of a future cell.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FutureId(u64);

impl FutureId {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FutureId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Completion callback registered on a future.
///
/// Identity is the closure allocation: cloning a `Callback` keeps it, so a
/// clone can be used to deduplicate and remove an earlier registration.
#[derive(Clone)]
pub struct Callback {
    f: Rc<dyn Fn()>,
}

impl Callback {
    pub fn new(f: impl Fn() + 'static) -> Self {
        Self { f: Rc::new(f) }
    }

    pub(crate) fn invoke(&self) {
        (self.f)()
    }

    pub fn same(&self, other: &Callback) -> bool {
        Rc::ptr_eq(&self.f, &other.f)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Rc::as_ptr(&self.f))
    }
}

/// Observable lifecycle of a future or task.
///
/// Plain futures move `Pending -> Succeeded | Failed`; tasks move
/// `Created -> Scheduled -> Running -> Succeeded | Failed`. Transitions are
/// monotone and never leave a terminal state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    Created,
    Scheduled,
    Running,
    Pending,
    Succeeded,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed)
    }
}

enum CellState<T> {
    Pending {
        callbacks: Vec<Callback>,
    },
    Succeeded {
        value: T,
        scheduled: Vec<(Callback, Handle)>,
    },
    Failed {
        error: Error,
        retrieved: Cell<bool>,
        scheduled: Vec<(Callback, Handle)>,
    },
}

/// Single-assignment cell behind every future and task.
///
/// Completion captures the registered callbacks, submits each to the loop
/// with the cell's scheduling context, and swaps the state to the terminal
/// variant; observers see the new state synchronously while the
/// notifications run on later loop ticks, in registration order.
pub(crate) struct FutureCell<T> {
    id: FutureId,
    loop_handle: LoopHandle,
    label: Option<Rc<str>>,
    context: SchedContext,
    state: RefCell<CellState<T>>,
}

impl<T: 'static> FutureCell<T> {
    pub(crate) fn raw(
        loop_handle: LoopHandle,
        label: Option<&str>,
        extra: Vec<(&'static str, Rc<str>)>,
    ) -> Self {
        let id = FutureId::fresh();
        let label: Option<Rc<str>> = label.map(Rc::from);
        let context = SchedContext {
            future_id: id.raw(),
            future_label: label.clone(),
            extra,
        };
        Self {
            id,
            loop_handle,
            label,
            context,
            state: RefCell::new(CellState::Pending { callbacks: Vec::new() }),
        }
    }

    pub(crate) fn new(
        loop_handle: LoopHandle,
        label: Option<&str>,
        extra: Vec<(&'static str, Rc<str>)>,
    ) -> Rc<Self> {
        Rc::new(Self::raw(loop_handle, label, extra))
    }

    pub(crate) fn context(&self) -> &SchedContext {
        &self.context
    }

    pub(crate) fn fut_id(&self) -> FutureId {
        self.id
    }

    pub(crate) fn loop_ref(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub(crate) fn label_ref(&self) -> Option<Rc<str>> {
        self.label.clone()
    }

    /// Completes the cell. The registered callbacks are handed to the loop
    /// before the state swap so a callback firing later observes the
    /// terminal state.
    pub(crate) fn finish(&self, outcome: Result<T, Error>) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        let CellState::Pending { callbacks } = &mut *state else {
            return Err(Error::Finished);
        };
        let callbacks = std::mem::take(callbacks);
        let scheduled = callbacks
            .into_iter()
            .map(|cb| {
                let run = cb.clone();
                let handle = self
                    .loop_handle
                    .call_soon(Box::new(move || run.invoke()), self.context.clone());
                (cb, handle)
            })
            .collect();
        *state = match outcome {
            Ok(value) => CellState::Succeeded { value, scheduled },
            Err(error) => CellState::Failed { error, retrieved: Cell::new(false), scheduled },
        };
        Ok(())
    }

    pub(crate) fn cell_state(&self) -> State {
        match &*self.state.borrow() {
            CellState::Pending { .. } => State::Pending,
            CellState::Succeeded { .. } => State::Succeeded,
            CellState::Failed { .. } => State::Failed,
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.cell_state().is_terminal()
    }

    pub(crate) fn cancelled(&self) -> bool {
        matches!(
            &*self.state.borrow(),
            CellState::Failed { error: Error::Cancelled(_), .. }
        )
    }

    /// The stored outcome; marks a failure as retrieved.
    pub(crate) fn outcome(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        match &*self.state.borrow() {
            CellState::Pending { .. } => Err(Error::NotReady),
            CellState::Succeeded { value, .. } => Ok(value.clone()),
            CellState::Failed { error, retrieved, .. } => {
                retrieved.set(true);
                Err(error.clone())
            }
        }
    }

    pub(crate) fn failure(&self) -> Result<Option<Error>, Error> {
        match &*self.state.borrow() {
            CellState::Pending { .. } => Err(Error::NotReady),
            CellState::Succeeded { .. } => Ok(None),
            CellState::Failed { error, retrieved, .. } => {
                retrieved.set(true);
                Ok(Some(error.clone()))
            }
        }
    }

    pub(crate) fn subscribe(&self, cb: Callback) -> Result<(), Error> {
        match &mut *self.state.borrow_mut() {
            CellState::Pending { callbacks } => {
                if !callbacks.iter().any(|existing| existing.same(&cb)) {
                    callbacks.push(cb);
                }
                Ok(())
            }
            _ => Err(Error::Finished),
        }
    }

    pub(crate) fn unsubscribe(&self, cb: &Callback) {
        match &mut *self.state.borrow_mut() {
            CellState::Pending { callbacks } => {
                callbacks.retain(|existing| !existing.same(cb));
            }
            CellState::Succeeded { scheduled, .. } | CellState::Failed { scheduled, .. } => {
                if let Some(pos) = scheduled.iter().position(|(existing, _)| existing.same(cb)) {
                    let (_, handle) = scheduled.remove(pos);
                    handle.cancel();
                }
            }
        }
    }
}

impl<T> Drop for FutureCell<T> {
    fn drop(&mut self) {
        match self.state.get_mut() {
            CellState::Pending { .. } => {
                tracing::warn!(
                    future_id = self.id.raw(),
                    label = self.label.as_deref().unwrap_or(""),
                    "future dropped while still pending"
                );
            }
            CellState::Failed { error, retrieved, .. } if !retrieved.get() => {
                tracing::warn!(
                    future_id = self.id.raw(),
                    label = self.label.as_deref().unwrap_or(""),
                    %error,
                    "future dropped with its error never retrieved"
                );
            }
            _ => {}
        }
    }
}

/// Type-erased surface shared by plain futures and tasks. Cancellation
/// dispatches by kind: a plain future simply fails with the given
/// `Cancelled`, a task runs the task cancellation protocol.
pub(crate) trait CellOps {
    fn id(&self) -> FutureId;
    fn loop_handle(&self) -> LoopHandle;
    fn label(&self) -> Option<Rc<str>>;
    fn state(&self) -> State;
    fn is_finished(&self) -> bool;
    fn is_cancelled(&self) -> bool;
    fn exception(&self) -> Result<Option<Error>, Error>;
    fn add_callback(&self, cb: Callback) -> Result<(), Error>;
    fn remove_callback(&self, cb: &Callback);
    fn cancel(&self, reason: Cancelled) -> Result<(), Error>;
}

/// Typed read surface on top of [`CellOps`].
pub(crate) trait Observe<T>: CellOps {
    fn try_result(&self) -> Result<T, Error>;
    fn erased(self: Rc<Self>) -> FutureRef;
}

impl<T: Clone + 'static> CellOps for FutureCell<T> {
    fn id(&self) -> FutureId {
        self.id
    }

    fn loop_handle(&self) -> LoopHandle {
        self.loop_handle.clone()
    }

    fn label(&self) -> Option<Rc<str>> {
        self.label.clone()
    }

    fn state(&self) -> State {
        self.cell_state()
    }

    fn is_finished(&self) -> bool {
        self.finished()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled()
    }

    fn exception(&self) -> Result<Option<Error>, Error> {
        self.failure()
    }

    fn add_callback(&self, cb: Callback) -> Result<(), Error> {
        self.subscribe(cb)
    }

    fn remove_callback(&self, cb: &Callback) {
        self.unsubscribe(cb)
    }

    fn cancel(&self, reason: Cancelled) -> Result<(), Error> {
        self.finish(Err(Error::Cancelled(reason)))
    }
}

impl<T: Clone + 'static> Observe<T> for FutureCell<T> {
    fn try_result(&self) -> Result<T, Error> {
        self.outcome()
    }

    fn erased(self: Rc<Self>) -> FutureRef {
        FutureRef(self)
    }
}

/// Type-erased shared handle to a future or task.
#[derive(Clone)]
pub struct FutureRef(pub(crate) Rc<dyn CellOps>);

impl FutureRef {
    pub fn id(&self) -> FutureId {
        self.0.id()
    }

    pub fn label(&self) -> Option<Rc<str>> {
        self.0.label()
    }

    pub fn state(&self) -> State {
        self.0.state()
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// The stored error, or `None` on success; fails with
    /// [`Error::NotReady`] while unfinished. Marks the error retrieved.
    pub fn exception(&self) -> Result<Option<Error>, Error> {
        self.0.exception()
    }

    pub fn cancel(&self, reason: impl Into<Cancelled>) -> Result<(), Error> {
        self.0.cancel(reason.into())
    }

    pub fn add_callback(&self, cb: Callback) -> Result<(), Error> {
        self.0.add_callback(cb)
    }

    pub fn remove_callback(&self, cb: &Callback) {
        self.0.remove_callback(cb)
    }

    pub fn same(&self, other: &FutureRef) -> bool {
        self.0.id() == other.0.id()
    }
}

impl fmt::Debug for FutureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureRef")
            .field("id", &self.0.id())
            .field("label", &self.0.label())
            .field("state", &self.0.state())
            .finish()
    }
}

/// Shared read handle to a deferred value.
///
/// All clones observe the same cell; the value is delivered to every awaiter,
/// which is why awaiting requires `T: Clone`. Completion happens through the
/// matching [`Promise`](crate::Promise), or, for tasks, by the task driver.
pub struct Future<T> {
    pub(crate) cell: Rc<dyn Observe<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self { cell: Rc::clone(&self.cell) }
    }
}

impl<T: Clone + 'static> Future<T> {
    pub(crate) fn from_cell(cell: Rc<dyn Observe<T>>) -> Self {
        Self { cell }
    }

    pub fn id(&self) -> FutureId {
        self.cell.id()
    }

    pub fn label(&self) -> Option<Rc<str>> {
        self.cell.label()
    }

    pub fn state(&self) -> State {
        self.cell.state()
    }

    pub fn is_finished(&self) -> bool {
        self.cell.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.cell.loop_handle()
    }

    /// The value on success; the stored error on failure (marked
    /// retrieved); [`Error::NotReady`] while unfinished.
    pub fn result(&self) -> Result<T, Error> {
        self.cell.try_result()
    }

    /// The stored error, or `None` on success; [`Error::NotReady`] while
    /// unfinished. Marks the error retrieved.
    pub fn exception(&self) -> Result<Option<Error>, Error> {
        self.cell.exception()
    }

    /// Registers `cb` to run via the loop after completion. Duplicate
    /// registrations of the same callback are ignored. Fails with
    /// [`Error::Finished`] on a terminal future: callers branch on
    /// `is_finished` and invoke directly, keeping completion ordering at the
    /// boundary explicit.
    pub fn add_callback(&self, cb: Callback) -> Result<(), Error> {
        self.cell.add_callback(cb)
    }

    /// Removes a registration; idempotent. On a terminal future this revokes
    /// the already-enqueued notification if it has not run yet.
    pub fn remove_callback(&self, cb: &Callback) {
        self.cell.remove_callback(cb)
    }

    pub fn to_ref(&self) -> FutureRef {
        Rc::clone(&self.cell).erased()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("id", &self.cell.id())
            .field("label", &self.cell.label())
            .field("state", &self.cell.state())
            .finish()
    }
}

/// Await guard produced by [`Future::into_future`].
///
/// Inside a task step the first pending poll records the cell as the task's
/// `waiting_on`; the resumption poll returns the outcome. Being polled again
/// while the cell is still pending means the driver resumed the coroutine
/// without a completion, which is a runtime fault. An armed inner-cancel is
/// consumed by the first poll after resumption and surfaces as
/// `Err(Cancelled)` regardless of the cell's state.
pub struct Awaited<T> {
    cell: Rc<dyn Observe<T>>,
    yielded: bool,
}

impl<T> Unpin for Awaited<T> {}

impl<T: Clone + 'static> std::future::Future for Awaited<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(cancel) = step::take_injected() {
            return Poll::Ready(Err(Error::Cancelled(cancel)));
        }
        if this.cell.is_finished() {
            return Poll::Ready(this.cell.try_result());
        }
        if this.yielded {
            return Poll::Ready(Err(Error::runtime(
                "future resumed while still pending",
            )));
        }
        match step::record_await(Rc::clone(&this.cell).erased()) {
            Ok(()) => {
                this.yielded = true;
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl<T: Clone + 'static> std::future::IntoFuture for Future<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Awaited<T>;

    fn into_future(self) -> Awaited<T> {
        Awaited { cell: self.cell, yielded: false }
    }
}

impl<T: Clone + 'static> std::future::IntoFuture for &Future<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Awaited<T>;

    fn into_future(self) -> Awaited<T> {
        Awaited { cell: Rc::clone(&self.cell), yielded: false }
    }
}
