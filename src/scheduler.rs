//! Deferred execution for promise continuations.
//!
//! Handlers never run inside the call that registered them or the call that
//! settled their promise. Instead they are handed to a [`Scheduler`] as a
//! [`Task`], and the scheduler runs them later in FIFO order. The bundled
//! [`MicrotaskQueue`] does nothing until it is driven explicitly, which makes
//! every turn observable from tests.
//!
use crate::{Error, Promise};
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

/// A zero-argument unit of deferred work.
pub type Task = Box<dyn FnOnce() + 'static>;

/// Shared handle to the scheduler a promise reports to.
pub type SchedulerRef = Rc<dyn Scheduler>;

/// Defers a task until the current synchronous turn has finished.
///
/// Implementations must run tasks in the order they were scheduled and must
/// never run a task from inside `schedule` itself.
pub trait Scheduler {
    fn schedule(&self, task: Task);
}

/// Default number of turns a single drive call may run.
pub const DEFAULT_MAX_TURNS: usize = 1 << 20;

/// Limits applied by the [`MicrotaskQueue`] drivers.
///
/// # Examples
///
/// ```
/// use promise_cell::{MicrotaskQueue, QueueConfig};
/// let queue = MicrotaskQueue::with_config(QueueConfig::new().max_turns(64));
/// assert_eq!(queue.config().max_turns, Some(64));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Upper bound on tasks run by one call to `run_until_idle` or
    /// `run_until_settled`; `None` drains without a bound.
    pub max_turns: Option<usize>,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_turns(mut self, limit: usize) -> Self {
        self.max_turns = Some(limit);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.max_turns = None;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_turns: Some(DEFAULT_MAX_TURNS),
        }
    }
}

/// FIFO microtask queue. Clones share the same queue.
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    tasks: VecDeque<Task>,
    config: QueueConfig,
    turns: u64,
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("MicrotaskQueue")
            .field("queued", &inner.tasks.len())
            .field("turns", &inner.turns)
            .field("config", &inner.config)
            .finish()
    }
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config,
                ..Inner::default()
            })),
        }
    }

    pub fn config(&self) -> QueueConfig {
        self.inner.borrow().config
    }

    /// A scheduler handle feeding this queue, for use with promise constructors.
    pub fn scheduler(&self) -> SchedulerRef {
        Rc::new(self.clone())
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.inner.borrow().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().tasks.is_empty()
    }

    /// Total tasks executed over the queue's lifetime.
    pub fn turns(&self) -> u64 {
        self.inner.borrow().turns
    }

    /// Runs exactly one task. Returns `false` if the queue was empty.
    pub fn run_once(&self) -> bool {
        // The borrow must end before the task runs; tasks schedule more tasks.
        let task = self.inner.borrow_mut().tasks.pop_front();
        match task {
            Some(task) => {
                task();
                self.inner.borrow_mut().turns += 1;
                true
            }
            None => false,
        }
    }

    /// Runs tasks, including the ones they schedule, until the queue is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_cell::{MicrotaskQueue, Promise, Resolution};
    /// let queue = MicrotaskQueue::new();
    /// let p = Promise::<i32, String>::resolve(&queue.scheduler(), 1)
    ///     .and_then(|v| Ok(Resolution::Value(v + 1)));
    /// assert_eq!(p.peek(), None);
    /// queue.run_until_idle().unwrap();
    /// assert_eq!(p.peek(), Some(Ok(2)));
    /// ```
    pub fn run_until_idle(&self) -> Result<usize, Error> {
        let limit = self.config().max_turns;
        let mut ran = 0;
        while !self.is_empty() {
            if let Some(limit) = limit {
                if ran >= limit {
                    tracing::warn!(limit, queued = self.len(), "microtask turn limit reached");
                    return Err(Error::TurnLimitExceeded { limit });
                }
            }
            self.run_once();
            ran += 1;
        }
        tracing::trace!(ran, "microtask queue idle");
        Ok(ran)
    }

    /// Drives the queue one turn at a time until `promise` settles and
    /// returns its outcome.
    pub fn run_until_settled<T, E>(&self, promise: &Promise<T, E>) -> Result<Result<T, E>, Error>
    where
        T: Clone,
        E: Clone,
    {
        let limit = self.config().max_turns;
        let mut ran = 0;
        loop {
            if let Some(outcome) = promise.peek() {
                return Ok(outcome);
            }
            if let Some(limit) = limit {
                if ran >= limit {
                    tracing::warn!(limit, queued = self.len(), "microtask turn limit reached");
                    return Err(Error::TurnLimitExceeded { limit });
                }
            }
            if !self.run_once() {
                return Err(Error::Stalled);
            }
            ran += 1;
        }
    }
}

impl Scheduler for MicrotaskQueue {
    fn schedule(&self, task: Task) {
        self.inner.borrow_mut().tasks.push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, n: u32) -> Task {
        let log = log.clone();
        Box::new(move || log.borrow_mut().push(n))
    }

    #[test]
    fn schedule_does_not_run_inline() {
        let queue = MicrotaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.schedule(recorder(&log, 1));
        assert!(log.borrow().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn tasks_run_in_fifo_order() {
        let queue = MicrotaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner_queue = queue.clone();
        let inner_log = log.clone();
        queue.schedule(Box::new(move || {
            inner_log.borrow_mut().push(1);
            inner_queue.schedule(recorder(&inner_log, 4));
        }));
        queue.schedule(recorder(&log, 2));
        queue.schedule(recorder(&log, 3));

        assert_eq!(queue.run_until_idle(), Ok(4));
        assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
        assert_eq!(queue.turns(), 4);
        assert!(queue.is_empty());
    }

    #[test]
    fn run_once_steps_a_single_turn() {
        let queue = MicrotaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.schedule(recorder(&log, 1));
        queue.schedule(recorder(&log, 2));
        assert!(queue.run_once());
        assert_eq!(*log.borrow(), vec![1]);
        assert!(queue.run_once());
        assert!(!queue.run_once());
    }

    fn reschedule_forever(queue: MicrotaskQueue) {
        let next = queue.clone();
        queue.schedule(Box::new(move || reschedule_forever(next)));
    }

    #[test]
    fn turn_limit_stops_runaway_loops() {
        let queue = MicrotaskQueue::with_config(QueueConfig::new().max_turns(10));
        reschedule_forever(queue.clone());
        assert_eq!(queue.run_until_idle(), Err(Error::TurnLimitExceeded { limit: 10 }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn zero_turn_limit_runs_nothing() {
        let queue = MicrotaskQueue::with_config(QueueConfig::new().max_turns(0));
        assert_eq!(queue.run_until_idle(), Ok(0));

        let log = Rc::new(RefCell::new(Vec::new()));
        queue.schedule(recorder(&log, 1));
        assert_eq!(queue.run_until_idle(), Err(Error::TurnLimitExceeded { limit: 0 }));
        assert!(log.borrow().is_empty());
        assert_eq!(queue.turns(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn limit_equal_to_the_work_is_not_exceeded() {
        let queue = MicrotaskQueue::with_config(QueueConfig::new().max_turns(2));
        let log = Rc::new(RefCell::new(Vec::new()));
        queue.schedule(recorder(&log, 1));
        queue.schedule(recorder(&log, 2));
        assert_eq!(queue.run_until_idle(), Ok(2));
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn unbounded_config_has_no_limit() {
        let config = QueueConfig::new().max_turns(3).unbounded();
        assert_eq!(config.max_turns, None);
        assert_eq!(QueueConfig::default().max_turns, Some(DEFAULT_MAX_TURNS));
    }
}
