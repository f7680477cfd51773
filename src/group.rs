use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future as StdFuture;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::error::{Cancelled, Error, MultiError};
use crate::event_loop::LoopHandle;
use crate::future::FutureRef;
use crate::future_ext::shield;
use crate::gather::iter_done;
use crate::task::{create_task_labeled, current_loop, Task};

/// Structured-concurrency scope binding a dynamic set of tasks to a lexical
/// region.
///
/// Created through [`task_group!`](crate::task_group) /
/// [`task_group_fn`]; the scope does not exit until every spawned child has
/// finished, and child failures are aggregated instead of lost.
pub struct TaskGroup {
    children: RefCell<Vec<FutureRef>>,
    finalized: Cell<bool>,
    loop_handle: LoopHandle,
}

impl TaskGroup {
    pub(crate) fn new(loop_handle: LoopHandle) -> Self {
        Self {
            children: RefCell::new(Vec::new()),
            finalized: Cell::new(false),
            loop_handle,
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.finalized.get() {
            return Err(Error::runtime(
                "spawning inside a task group after it started joining is forbidden",
            ));
        }
        Ok(())
    }

    /// Creates and schedules a child task. Fails with a runtime fault once
    /// the group has begun joining.
    pub fn spawn<T: Clone + 'static>(
        &self,
        coro: impl StdFuture<Output = Result<T, Error>> + 'static,
    ) -> Result<Task<T>, Error> {
        self.spawn_labeled(coro, "task-group-child")
    }

    pub fn spawn_labeled<T: Clone + 'static>(
        &self,
        coro: impl StdFuture<Output = Result<T, Error>> + 'static,
        label: &str,
    ) -> Result<Task<T>, Error> {
        self.ensure_open()?;
        let task = create_task_labeled(coro, &self.loop_handle, label);
        self.children.borrow_mut().push(task.to_ref());
        Ok(task)
    }

    /// Spawns a child and suspends until it has executed at least one
    /// coroutine step. The wait is shielded, so cancelling the caller does
    /// not cancel the child's start.
    pub async fn wait_started<T: Clone + 'static>(
        &self,
        coro: impl StdFuture<Output = Result<T, Error>> + 'static,
    ) -> Result<Task<T>, Error> {
        let task = self.spawn(coro)?;
        shield(&task.started_future()).await?;
        Ok(task)
    }

    /// Cancels every live child with the given reason; finished children are
    /// skipped. Does not wait for the children to unwind.
    pub fn cancel(&self, reason: impl Into<Cancelled>) {
        let reason = reason.into();
        for child in self.children.borrow().iter() {
            if child.is_finished() {
                continue;
            }
            if let Err(err) = child.cancel(reason.clone()) {
                tracing::debug!(%err, child = ?child, "child refused cancellation");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.children.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.borrow().is_empty()
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("children", &self.children.borrow().len())
            .field("finalized", &self.finalized.get())
            .finish()
    }
}

/// Awaits every child in completion order, then aggregates the child errors
/// (spawn order) into a single [`MultiError`]. Runs as its own task so the
/// scope can shield it from inbound cancellation.
async fn join_children(group: Rc<TaskGroup>) -> Result<(), Error> {
    group.finalized.set(true);
    let children: Vec<FutureRef> = group.children.borrow().clone();

    let mut done = iter_done(children.iter().cloned());
    loop {
        match done.next().await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(Error::Cancelled(_)) => {
                return Err(Error::runtime(
                    "task group cancelled while joining child tasks",
                ))
            }
            Err(err) => return Err(err),
        }
    }
    debug_assert!(children.iter().all(|child| child.is_finished()));

    let errors: Vec<Error> = children
        .iter()
        .filter_map(|child| child.exception().ok().flatten())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Multi(MultiError::new("child task errors", errors)))
    }
}

/// Runs `body` against a fresh [`TaskGroup`] and joins every child before
/// returning; normally invoked through [`task_group!`](crate::task_group).
///
/// Exit paths:
///
/// 1. body returned `Ok`: join the children, then surface their aggregated
///    errors, if any;
/// 2. body returned `Err`: cancel the group, join, and combine the body
///    error with the join outcome;
/// 3. the scope's own task is cancelled while joining: the join runs as a
///    shielded task, every inbound cancellation is converted into another
///    `group.cancel()`, and the cancellation is re-raised only if the join
///    task itself was cancelled.
///
/// Whatever happens, no child task outlives the scope.
pub async fn task_group_fn<T: Clone + 'static>(
    body: impl FnOnce(Rc<TaskGroup>) -> LocalBoxFuture<'static, Result<T, Error>>,
) -> Result<T, Error> {
    let loop_handle = current_loop()?;
    let group = Rc::new(TaskGroup::new(loop_handle.clone()));

    let body_out = body(Rc::clone(&group)).await;
    if body_out.is_err() {
        group.cancel(Cancelled::with_msg(
            "task group body failed, cancelling children",
        ));
    }

    let join_task = create_task_labeled(
        join_children(Rc::clone(&group)),
        &loop_handle,
        "task-group-join",
    );
    let join_out: Result<(), Error> = loop {
        match shield(&join_task.future()).await {
            Ok(()) => break Ok(()),
            Err(Error::Cancelled(cancel)) => {
                if join_task.is_cancelled() {
                    break Err(Error::Cancelled(cancel));
                }
                // An inbound cancel reached the scope mid-join: push it down
                // to the children and keep joining.
                group.cancel(cancel);
            }
            Err(err) => break Err(err),
        }
    };

    match (body_out, join_out) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(join_err)) => Err(join_err),
        (Err(body_err), Ok(())) => Err(body_err),
        (Err(body_err), Err(join_err)) => match join_err {
            Error::Multi(_) | Error::Cancelled(_) => Err(Error::Multi(MultiError::new(
                "body exception aborts children task",
                [body_err, join_err],
            ))),
            other => {
                tracing::warn!(%other, "join failed after a body error; reporting the body error");
                Err(body_err)
            }
        },
    }
}
