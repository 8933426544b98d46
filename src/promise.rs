//! The settlement cell and its continuation registrar.
//!
//! A [`Promise`] starts pending and is settled at most once through a
//! [`Resolver`]. Continuations registered with [`Promise::then`] are queued
//! on the promise's scheduler and each produces a new chained promise, which
//! is settled from the continuation's return value by the resolution
//! procedure in [`crate::resolution`].
//!
use crate::error::guard;
use crate::resolution::{Resolution, Thenable, Trampoline};
use crate::scheduler::SchedulerRef;
use crate::Error;
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

/// A value that will eventually be fulfilled with a `T` or rejected with an
/// `E`, exactly once.
///
/// Clones are handles to the same cell. Continuations registered with
/// [`then`](Promise::then) always run on the promise's scheduler, never
/// inside the registering or settling call.
///
/// # Examples
///
/// ```
/// use promise_cell::{MicrotaskQueue, Promise, Resolution};
/// let queue = MicrotaskQueue::new();
/// let p = Promise::<String, String>::new(&queue.scheduler(), |resolver| {
///     resolver.fulfill("🍓".into());
///     Ok(())
/// });
/// let len = p.and_then(|s| Ok(Resolution::Value(s.len())));
/// assert_eq!(queue.run_until_settled(&len), Ok(Ok(4)));
/// ```
pub struct Promise<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
    scheduler: SchedulerRef,
}

/// Observable lifecycle of a [`Promise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Fulfilled => f.write_str("fulfilled"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

type Reaction<V> = Box<dyn FnOnce(V) + 'static>;

/// Type-erased handle to a cell that a pending reaction will settle.
pub(crate) type Link = Rc<dyn Detach>;

/// Teardown hook for cells kept alive only by another cell's reactions.
pub(crate) trait Detach {
    /// Drops the cell's pending reactions and hands back its own downstream
    /// links, so a chain can be torn down one cell at a time.
    fn detach(&self) -> Vec<Link>;
}

struct Inner<T, E> {
    state: State<T, E>,
    // Non-empty only while pending; drained once in registration order.
    on_fulfilled: Vec<Reaction<T>>,
    on_rejected: Vec<Reaction<E>>,
    // Cells the reactions above settle.
    downstream: Vec<Link>,
    wakers: Vec<Waker>,
}

impl<T, E> Detach for RefCell<Inner<T, E>> {
    fn detach(&self) -> Vec<Link> {
        let (on_fulfilled, on_rejected, downstream) = match self.try_borrow_mut() {
            Ok(mut inner) => (
                std::mem::take(&mut inner.on_fulfilled),
                std::mem::take(&mut inner.on_rejected),
                std::mem::take(&mut inner.downstream),
            ),
            Err(_) => return Vec::new(),
        };
        drop((on_fulfilled, on_rejected));
        downstream
    }
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        // A pending chain owns each next cell through its reactions; unlink it
        // with a work list so teardown depth stays constant.
        let mut links = std::mem::take(&mut self.downstream);
        self.on_fulfilled.clear();
        self.on_rejected.clear();
        while let Some(link) = links.pop() {
            if Rc::strong_count(&link) == 1 {
                links.extend(link.detach());
            }
        }
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("state", &self.state()).finish()
    }
}

impl<T, E> Promise<T, E> {
    fn pending(scheduler: &SchedulerRef) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                on_fulfilled: Vec::new(),
                on_rejected: Vec::new(),
                downstream: Vec::new(),
                wakers: Vec::new(),
            })),
            scheduler: scheduler.clone(),
        }
    }

    pub fn state(&self) -> PromiseState {
        match self.inner.borrow().state {
            State::Pending => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// Whether both handles refer to the same cell.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Rc::ptr_eq(&this.inner, &other.inner)
    }

    /// The scheduler this promise and every promise chained from it report to.
    pub fn scheduler(&self) -> &SchedulerRef {
        &self.scheduler
    }
}

impl<T: 'static, E: 'static> Promise<T, E> {
    pub(crate) fn link(&self) -> Link {
        self.inner.clone()
    }
}

impl<T: Clone, E: Clone> Promise<T, E> {
    /// The settled outcome, or `None` while pending.
    pub fn peek(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// Pending -> Fulfilled. No-op once settled.
    pub(crate) fn settle_fulfilled(&self, value: T) {
        let (reactions, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                tracing::trace!("ignoring fulfillment of a settled promise");
                return;
            }
            inner.state = State::Fulfilled(value.clone());
            inner.on_rejected.clear();
            inner.downstream.clear();
            (
                std::mem::take(&mut inner.on_fulfilled),
                std::mem::take(&mut inner.wakers),
            )
        };
        tracing::trace!(reactions = reactions.len(), "promise fulfilled");
        for reaction in reactions {
            reaction(value.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Pending -> Rejected. No-op once settled.
    pub(crate) fn settle_rejected(&self, reason: E) {
        let (reactions, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                tracing::trace!("ignoring rejection of a settled promise");
                return;
            }
            inner.state = State::Rejected(reason.clone());
            inner.on_fulfilled.clear();
            inner.downstream.clear();
            (
                std::mem::take(&mut inner.on_rejected),
                std::mem::take(&mut inner.wakers),
            )
        };
        tracing::trace!(reactions = reactions.len(), "promise rejected");
        for reaction in reactions {
            reaction(reason.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Promise<T, E> {
    /// Registers a pair of callbacks without creating a chained promise.
    ///
    /// Against a settled cell the matching callback is scheduled right away.
    /// Against a pending one, wrappers are queued that schedule it when the
    /// cell settles. Either way it runs on a later turn.
    ///
    /// `downstream` is the cell the callbacks settle; it is unlinked without
    /// recursion if this cell is dropped while still pending.
    pub(crate) fn subscribe<F, R>(&self, downstream: Link, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + 'static,
        R: FnOnce(E) + 'static,
    {
        match self.peek() {
            Some(Ok(value)) => self.scheduler.schedule(Box::new(move || on_fulfilled(value))),
            Some(Err(reason)) => self.scheduler.schedule(Box::new(move || on_rejected(reason))),
            None => {
                let mut inner = self.inner.borrow_mut();
                let scheduler = self.scheduler.clone();
                inner.on_fulfilled.push(Box::new(move |value: T| {
                    scheduler.schedule(Box::new(move || on_fulfilled(value)))
                }));
                let scheduler = self.scheduler.clone();
                inner.on_rejected.push(Box::new(move |reason: E| {
                    scheduler.schedule(Box::new(move || on_rejected(reason)))
                }));
                inner.downstream.push(downstream);
            }
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a promise and runs `setup` synchronously with its resolver.
    ///
    /// An `Err` returned from `setup`, or a panic inside it, rejects the
    /// promise unless the resolver was already used.
    pub fn new<F>(scheduler: &SchedulerRef, setup: F) -> Self
    where
        F: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let (resolver, promise) = Self::with_resolvers(scheduler);
        let capabilities = resolver.clone();
        if let Err(reason) = guard(move || setup(capabilities)) {
            tracing::debug!(already_settled = resolver.is_called(), "promise setup failed");
            resolver.reject(reason);
        }
        promise
    }

    /// A pending promise together with the resolver that settles it.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_cell::{MicrotaskQueue, Promise};
    /// let queue = MicrotaskQueue::new();
    /// let (resolver, promise) = Promise::<u8, String>::with_resolvers(&queue.scheduler());
    /// assert!(promise.is_pending());
    /// resolver.reject("💥".into());
    /// assert_eq!(promise.peek(), Some(Err("💥".to_string())));
    /// ```
    pub fn with_resolvers(scheduler: &SchedulerRef) -> (Resolver<T, E>, Self) {
        let promise = Self::pending(scheduler);
        (Resolver::new(promise.clone()), promise)
    }

    /// A promise resolved with `value`. Promises and thenables are adopted
    /// through the regular resolution procedure.
    pub fn resolve_with(scheduler: &SchedulerRef, value: impl Into<Resolution<T, E>>) -> Self {
        let value = value.into();
        Self::new(scheduler, move |resolver| {
            resolver.resolve(value);
            Ok(())
        })
    }

    /// A promise fulfilled with a plain `value`.
    pub fn resolve(scheduler: &SchedulerRef, value: T) -> Self {
        Self::resolve_with(scheduler, Resolution::Value(value))
    }

    /// A promise rejected with `reason`, verbatim.
    pub fn reject(scheduler: &SchedulerRef, reason: E) -> Self {
        Self::new(scheduler, move |resolver| {
            resolver.reject(reason);
            Ok(())
        })
    }

    /// Registers continuations and returns the promise they settle.
    ///
    /// Exactly one of the handlers runs, on a later scheduler turn, with the
    /// fulfilled value or the rejection reason. `Ok(x)` resolves the chained
    /// promise with `x`; `Err(reason)` or a panic rejects it.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        let (resolver, chained) = Promise::<U, E>::with_resolvers(&self.scheduler);
        let rejecting = resolver.clone();
        self.subscribe(
            chained.link(),
            move |value| react(&resolver, move || on_fulfilled(value)),
            move |reason| react(&rejecting, move || on_rejected(reason)),
        );
        chained
    }

    /// `then` with the rejection passed through unchanged.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.then(on_fulfilled, Err)
    }

    /// `then` with the fulfilled value passed through unchanged.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// Runs `on_finally` once this promise settles, then passes the outcome
    /// through. An `Err` from `on_finally` replaces the outcome.
    pub fn finally<F>(&self, on_finally: F) -> Promise<T, E>
    where
        F: FnOnce() -> Result<(), E> + 'static,
    {
        let cleanup = Rc::new(Cell::new(Some(on_finally)));
        let on_reject = cleanup.clone();
        self.then(
            move |value| {
                run_cleanup(&*cleanup)?;
                Ok(Resolution::Value(value))
            },
            move |reason| {
                run_cleanup(&*on_reject)?;
                Err(reason)
            },
        )
    }
}

fn run_cleanup<F, E>(cleanup: &Cell<Option<F>>) -> Result<(), E>
where
    F: FnOnce() -> Result<(), E>,
{
    match cleanup.take() {
        Some(f) => f(),
        None => Ok(()),
    }
}

fn react<U, E, H>(resolver: &Resolver<U, E>, handler: H)
where
    U: Clone + 'static,
    E: Clone + From<Error> + 'static,
    H: FnOnce() -> Result<Resolution<U, E>, E>,
{
    match guard(handler) {
        Ok(value) => resolver.resolve(value),
        Err(reason) => resolver.reject(reason),
    }
}

/// The settlement capabilities of one promise.
///
/// The first call to [`resolve`](Resolver::resolve),
/// [`fulfill`](Resolver::fulfill) or [`reject`](Resolver::reject), on this
/// resolver or any clone of it, wins. Later calls are ignored. Resolving with
/// another promise or a thenable locks the target in to that value's outcome.
pub struct Resolver<T, E> {
    target: Promise<T, E>,
    called: Rc<Cell<bool>>,
    trampoline: Rc<Trampoline<T, E>>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            called: self.called.clone(),
            trampoline: self.trampoline.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("target", &self.target)
            .field("called", &self.called.get())
            .finish()
    }
}

impl<T, E> Resolver<T, E> {
    /// Whether this resolver has already been used.
    pub fn is_called(&self) -> bool {
        self.called.get()
    }

    pub(crate) fn target(&self) -> &Promise<T, E> {
        &self.target
    }

    pub(crate) fn called_flag(&self) -> Rc<Cell<bool>> {
        self.called.clone()
    }

    /// A fresh one-shot pair for the same target, handed to an adopted thenable.
    pub(crate) fn adopting(&self) -> Self {
        Self {
            target: self.target.clone(),
            called: Rc::new(Cell::new(false)),
            trampoline: self.trampoline.clone(),
        }
    }

    fn claim(&self) -> bool {
        if self.called.replace(true) {
            tracing::trace!("ignoring repeated settlement attempt");
            return false;
        }
        true
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn new(target: Promise<T, E>) -> Self {
        Self {
            target,
            called: Rc::new(Cell::new(false)),
            trampoline: Rc::new(Trampoline::new()),
        }
    }

    /// Resolves the target with a value, a promise, or a thenable.
    pub fn resolve(&self, value: impl Into<Resolution<T, E>>) {
        if self.claim() {
            self.trampoline.drive(self, value.into());
        }
    }

    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value));
    }

    pub fn reject(&self, reason: E) {
        if self.claim() {
            self.target.settle_rejected(reason);
        }
    }
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn as_promise(&self) -> Option<Promise<T, E>> {
        Some(self.clone())
    }

    fn then(&self, resolver: Resolver<T, E>) -> Result<(), E> {
        let rejecting = resolver.clone();
        self.subscribe(
            resolver.target().link(),
            move |value| resolver.fulfill(value),
            move |reason| rejecting.reject(reason),
        );
        Ok(())
    }
}

impl<T: Clone, E: Clone> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.peek() {
            return Poll::Ready(outcome);
        }
        let mut inner = self.inner.borrow_mut();
        if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
