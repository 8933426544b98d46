//! Resolving a promise from an arbitrary handler result.
//!
//! A handler may hand back a plain value, another [`Promise`], or any foreign
//! [`Thenable`]. Promises and thenables are adopted: the target promise
//! settles with whatever they eventually settle with, however deeply nested.
//! Adoption runs on a per-target work list rather than by recursion, so a
//! thenable that synchronously resolves with another thenable (and so on)
//! does not grow the stack.
//!
use crate::error::guard;
use crate::promise::{Promise, Resolver};
use crate::Error;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    rc::Rc,
};

/// Anything exposing a `then` that settles a [`Resolver`].
///
/// `then` may call the resolver now, later, more than once, or not at all;
/// only the first of `resolve`, `fulfill` or `reject` counts. An `Err`
/// returned (or a panic raised) before the resolver was used rejects the
/// adopting promise. After that it is ignored.
///
/// # Examples
///
/// ```
/// use promise_cell::{MicrotaskQueue, Promise, Resolution, Resolver, Thenable};
///
/// struct Ready(u32);
///
/// impl Thenable<u32, String> for Ready {
///     fn then(&self, resolver: Resolver<u32, String>) -> Result<(), String> {
///         resolver.fulfill(self.0);
///         resolver.fulfill(self.0 + 1);
///         Ok(())
///     }
/// }
///
/// let queue = MicrotaskQueue::new();
/// let p = Promise::<u32, String>::resolve_with(&queue.scheduler(), Resolution::thenable(Ready(7)));
/// assert_eq!(queue.run_until_settled(&p), Ok(Ok(7)));
/// ```
pub trait Thenable<T, E> {
    fn then(&self, resolver: Resolver<T, E>) -> Result<(), E>;

    /// The underlying promise, when this thenable is one of this crate's.
    /// Such thenables are adopted directly, identity check included.
    fn as_promise(&self) -> Option<Promise<T, E>> {
        None
    }
}

/// What a promise is resolved with.
pub enum Resolution<T, E> {
    /// A plain value; fulfills immediately.
    Value(T),
    /// A promise of this crate, adopted.
    Promise(Promise<T, E>),
    /// A foreign thenable, adopted through its `then`.
    Thenable(Rc<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn thenable(thenable: impl Thenable<T, E> + 'static) -> Self {
        Self::Thenable(Rc::new(thenable))
    }
}

impl<T, E> From<T> for Resolution<T, E> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Self::Promise(promise)
    }
}

impl<T, E> From<Rc<dyn Thenable<T, E>>> for Resolution<T, E> {
    fn from(thenable: Rc<dyn Thenable<T, E>>) -> Self {
        Self::Thenable(thenable)
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Promise(promise) => f.debug_tuple("Promise").field(promise).finish(),
            Self::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// Pending adoption steps for one target promise.
pub(crate) struct Trampoline<T, E> {
    queue: RefCell<VecDeque<Resolution<T, E>>>,
    running: Cell<bool>,
}

impl<T, E> Trampoline<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            running: Cell::new(false),
        }
    }
}

impl<T, E> Trampoline<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Queues `value` and, unless an outer call is already looping, runs
    /// adoption steps until none remain.
    pub(crate) fn drive(&self, resolver: &Resolver<T, E>, value: Resolution<T, E>) {
        self.queue.borrow_mut().push_back(value);
        if self.running.replace(true) {
            return;
        }
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some(value) => adopt(resolver, value),
                None => break,
            }
        }
        self.running.set(false);
    }
}

fn adopt<T, E>(resolver: &Resolver<T, E>, value: Resolution<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let target = resolver.target();
    match value {
        Resolution::Value(value) => target.settle_fulfilled(value),
        Resolution::Promise(promise) => adopt_promise(target, promise),
        Resolution::Thenable(thenable) => {
            if let Some(promise) = thenable.as_promise() {
                adopt_promise(target, promise);
                return;
            }
            let capabilities = resolver.adopting();
            let called = capabilities.called_flag();
            if let Err(reason) = guard(|| thenable.then(capabilities)) {
                if called.replace(true) {
                    tracing::debug!("ignoring error from a thenable that already settled");
                } else {
                    target.settle_rejected(reason);
                }
            }
        }
    }
}

fn adopt_promise<T, E>(target: &Promise<T, E>, promise: Promise<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    if Promise::ptr_eq(&promise, target) {
        tracing::debug!("promise resolved with itself");
        target.settle_rejected(E::from(Error::CycleDetected));
        return;
    }
    let (fulfilling, rejecting) = (target.clone(), target.clone());
    promise.subscribe(
        target.link(),
        move |value| fulfilling.settle_fulfilled(value),
        move |reason| rejecting.settle_rejected(reason),
    );
}
