use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Cooperative-cancel marker delivered through futures and tasks.
///
/// A `Cancelled` is never thrown by the runtime on its own; it always enters
/// through a `cancel` call and propagates out of await points as an ordinary
/// error. Cloning preserves identity: every clone of the same cancellation
/// reports `ptr_eq` with the original, so a cancellation can be traced
/// through an entire future chain.
///
/// Richer cancellation payloads attach via [`Cancelled::with_payload`] and
/// are recovered with [`Cancelled::payload`].
#[derive(Clone)]
pub struct Cancelled {
    inner: Rc<CancelledInner>,
}

struct CancelledInner {
    msg: Option<String>,
    payload: Option<Rc<dyn Any>>,
}

impl Cancelled {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(CancelledInner { msg: None, payload: None }),
        }
    }

    pub fn with_msg(msg: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(CancelledInner {
                msg: Some(msg.into()),
                payload: None,
            }),
        }
    }

    pub fn with_payload(msg: impl Into<String>, payload: Rc<dyn Any>) -> Self {
        Self {
            inner: Rc::new(CancelledInner {
                msg: Some(msg.into()),
                payload: Some(payload),
            }),
        }
    }

    pub fn msg(&self) -> Option<&str> {
        self.inner.msg.as_deref()
    }

    /// Downcasts the attached payload, if any.
    pub fn payload<P: 'static>(&self) -> Option<&P> {
        self.inner.payload.as_ref()?.downcast_ref()
    }

    /// Identity comparison: true iff both handles refer to the same
    /// cancellation event.
    pub fn ptr_eq(&self, other: &Cancelled) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Cancelled {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Cancelled {
    fn from(msg: &str) -> Self {
        Cancelled::with_msg(msg)
    }
}

impl From<String> for Cancelled {
    fn from(msg: String) -> Self {
        Cancelled::with_msg(msg)
    }
}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelled")
            .field("msg", &self.inner.msg)
            .finish()
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg() {
            Some(msg) => write!(f, "cancelled: {msg}"),
            None => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for Cancelled {}

/// Ordered aggregate of child errors.
///
/// Construction flattens nested aggregates, so the inner list never contains
/// another `MultiError`; inner errors keep their identity through the
/// flattening.
#[derive(Clone)]
pub struct MultiError {
    inner: Rc<MultiErrorInner>,
}

struct MultiErrorInner {
    message: String,
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new(message: impl Into<String>, errors: impl IntoIterator<Item = Error>) -> Self {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Multi(nested) => flat.extend(nested.errors().iter().cloned()),
                other => flat.push(other),
            }
        }
        Self {
            inner: Rc::new(MultiErrorInner { message: message.into(), errors: flat }),
        }
    }

    pub fn message(&self) -> &str {
        &self.inner.message
    }

    pub fn errors(&self) -> &[Error] {
        &self.inner.errors
    }

    pub(crate) fn same(&self, other: &MultiError) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiError")
            .field("message", &self.inner.message)
            .field("errors", &self.inner.errors)
            .finish()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} inner errors:", self.inner.message, self.inner.errors.len())?;
        for err in &self.inner.errors {
            write!(f, " [{err}]")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for MultiError {}

/// Every failure that can surface from the runtime.
///
/// `Cancelled`, `Multi` and `Other` carry `Rc`-backed payloads; cloning an
/// `Error` (which happens whenever a failed future is observed by more than
/// one awaiter) keeps the payload identity intact.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// `result()` or `exception()` called on a future that has not finished.
    #[error("future has no result yet")]
    NotReady,
    /// Write or cancel attempted on a future that already finished.
    #[error("future already finished")]
    Finished,
    /// Cooperative cancellation delivered through an await point.
    #[error("{0}")]
    Cancelled(#[from] Cancelled),
    /// A task attempted to cancel itself from inside its own step.
    #[error("task is forbidden to cancel itself")]
    SelfCancelForbidden,
    /// Aggregated child failures from a task group.
    #[error("{0}")]
    Multi(#[from] MultiError),
    /// Programming error: self-await, cross-loop await, foreign future,
    /// resumption of a still-pending future, spawn after finalize.
    #[error("runtime fault: {0}")]
    Runtime(Rc<str>),
    /// Verbatim user error.
    #[error("{0}")]
    Other(Rc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error value; `anyhow::Error` converts via its
    /// boxed form.
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Error::Other(Rc::from(err.into()))
    }

    pub(crate) fn runtime(msg: impl Into<Rc<str>>) -> Self {
        Error::Runtime(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Identity comparison. Payload-carrying variants compare by pointer,
    /// payload-free variants by kind.
    pub fn ptr_eq(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::Cancelled(a), Error::Cancelled(b)) => a.ptr_eq(b),
            (Error::Multi(a), Error::Multi(b)) => a.same(b),
            (Error::Other(a), Error::Other(b)) => Rc::ptr_eq(a, b),
            (Error::Runtime(a), Error::Runtime(b)) => Rc::ptr_eq(a, b),
            (Error::NotReady, Error::NotReady)
            | (Error::Finished, Error::Finished)
            | (Error::SelfCancelForbidden, Error::SelfCancelForbidden) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_clone_keeps_identity() {
        let c = Cancelled::with_msg("stop");
        let clone = c.clone();
        assert!(c.ptr_eq(&clone));
        assert_eq!(clone.msg(), Some("stop"));

        let unrelated = Cancelled::with_msg("stop");
        assert!(!c.ptr_eq(&unrelated));
    }

    #[test]
    fn cancelled_payload_downcasts() {
        let payload: Rc<dyn Any> = Rc::new(42_u32);
        let c = Cancelled::with_payload("deadline", payload);
        assert_eq!(c.payload::<u32>(), Some(&42));
        assert_eq!(c.payload::<String>(), None);
    }

    #[test]
    fn multi_error_flattens_nested_aggregates() {
        let e1 = Error::other(std::io::Error::new(std::io::ErrorKind::Other, "one"));
        let e2 = Error::Cancelled(Cancelled::new());
        let inner = MultiError::new("inner", [e1.clone(), e2.clone()]);
        let e3 = Error::other(std::io::Error::new(std::io::ErrorKind::Other, "three"));

        let outer = MultiError::new("outer", [e3.clone(), Error::Multi(inner)]);
        assert_eq!(outer.errors().len(), 3);
        assert!(outer.errors()[0].ptr_eq(&e3));
        assert!(outer.errors()[1].ptr_eq(&e1));
        assert!(outer.errors()[2].ptr_eq(&e2));
    }

    #[test]
    fn other_errors_compare_by_identity() {
        let a = Error::other(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        let c = Error::other(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!a.ptr_eq(&c));
    }
}
