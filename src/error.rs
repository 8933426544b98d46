use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// Failures produced by the crate itself.
///
/// The first two variants travel through a promise's rejection channel (the
/// reason type converts from `Error`), the last two are returned by the
/// [`MicrotaskQueue`](crate::MicrotaskQueue) drivers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("chaining cycle detected for promise")]
    CycleDetected,
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("microtask queue ran {limit} turns without going idle")]
    TurnLimitExceeded { limit: usize },
    #[error("microtask queue is idle but the promise is still pending")]
    Stalled,
}

impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}

/// Rejection reason of [`Promise::any`](crate::Promise::any) once every
/// operand has been rejected. Reasons are kept in operand order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("all promises were rejected")]
pub struct AggregateError<E> {
    pub errors: Vec<E>,
}

impl<E> AggregateError<E> {
    pub fn new(errors: Vec<E>) -> Self {
        Self { errors }
    }
}

/// An internal failure downstream of `any` becomes the single bundled reason.
impl<E: From<Error>> From<Error> for AggregateError<E> {
    fn from(err: Error) -> Self {
        Self {
            errors: vec![E::from(err)],
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Runs user code, turning a panic into `Error::Panicked` on the rejection
/// channel so it never unwinds through the caller.
pub(crate) fn guard<R, E, F>(f: F) -> Result<R, E>
where
    E: From<Error>,
    F: FnOnce() -> Result<R, E>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload);
            tracing::warn!(%message, "promise callback panicked");
            Err(E::from(Error::Panicked(message)))
        }
    }
}
