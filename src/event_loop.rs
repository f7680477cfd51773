use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

/// Work unit accepted by [`EventLoop::call_soon`]. Runs at most once, on the
/// loop thread.
pub type Thunk = Box<dyn FnOnce()>;

/// Work unit injected from another thread via a [`Notifier`].
pub type RemoteThunk = Box<dyn FnOnce() + Send>;

/// Identity of an event loop. Futures and tasks created on different loops
/// must never be mixed; the task driver enforces this by comparing ids.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LoopId(u64);

impl LoopId {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LoopId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// Scheduling context attached to every callback submission.
///
/// The loop enters a tracing span built from this around each callback it
/// runs, so diagnostic metadata follows an async call chain without being
/// threaded through user code.
#[derive(Clone, Debug, Default)]
pub struct SchedContext {
    pub future_id: u64,
    pub future_label: Option<Rc<str>>,
    pub extra: Vec<(&'static str, Rc<str>)>,
}

impl SchedContext {
    pub fn span(&self) -> tracing::Span {
        let label = self.future_label.as_deref().unwrap_or("");
        tracing::trace_span!("loop_callback", future_id = self.future_id, future_label = label)
    }
}

/// Revocable receipt of a `call_soon` submission.
///
/// `cancel` revokes the callback if it has not run yet; `is_executed`
/// observes whether it already ran.
#[derive(Clone)]
pub struct Handle {
    state: Rc<HandleState>,
}

struct HandleState {
    cancelled: Cell<bool>,
    executed: Cell<bool>,
}

impl Handle {
    pub fn new() -> Self {
        Self {
            state: Rc::new(HandleState { cancelled: Cell::new(false), executed: Cell::new(false) }),
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    pub fn is_executed(&self) -> bool {
        self.state.executed.get()
    }

    pub fn mark_executed(&self) {
        self.state.executed.set(true);
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("cancelled", &self.is_cancelled())
            .field("executed", &self.is_executed())
            .finish()
    }
}

/// The narrow contract the runtime core demands of a loop.
///
/// A conforming driver keeps a FIFO of ready callbacks, executes exactly one
/// at a time to completion, honors [`Handle::cancel`] and reports execution
/// through the handle. [`EventLoop::notifier`] is the only legal entry for
/// off-loop threads.
pub trait EventLoop {
    fn call_soon(&self, thunk: Thunk, context: SchedContext) -> Handle;
    fn notifier(&self) -> Notifier;
    fn id(&self) -> LoopId;
}

/// Shared handle to a loop, cheap to clone and compare.
#[derive(Clone)]
pub struct LoopHandle {
    raw: Rc<dyn EventLoop>,
}

impl LoopHandle {
    pub fn new(raw: Rc<dyn EventLoop>) -> Self {
        Self { raw }
    }

    pub fn call_soon(&self, thunk: Thunk, context: SchedContext) -> Handle {
        self.raw.call_soon(thunk, context)
    }

    pub fn notifier(&self) -> Notifier {
        self.raw.notifier()
    }

    pub fn id(&self) -> LoopId {
        self.raw.id()
    }

    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LoopHandle").field(&self.id()).finish()
    }
}

/// Thread-safe entry into a loop.
///
/// Closures submitted here run on the loop thread on its next pump. The
/// notifier itself is `Send + Clone` so it can be handed to worker threads;
/// everything else in the runtime stays on the loop thread.
#[derive(Clone)]
pub struct Notifier {
    tx: async_channel::Sender<RemoteThunk>,
}

impl Notifier {
    pub fn new(tx: async_channel::Sender<RemoteThunk>) -> Self {
        Self { tx }
    }

    pub fn call_soon_threadsafe(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), Error> {
        self.tx
            .try_send(Box::new(f))
            .map_err(|_| Error::runtime("event loop is gone"))
    }
}
