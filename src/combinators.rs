//! Aggregate operations over an ordered collection of operands.
//!
//! Every operand is either a [`Promise`] or something a promise can be
//! resolved with; non-promise operands are first turned into promises with
//! [`Promise::resolve_with`]. Results are reported in operand order, while
//! `race` and `any` settle in completion order. Losing operands keep running;
//! their outcomes are simply ignored.
//!
use crate::promise::{Promise, PromiseState};
use crate::resolution::Resolution;
use crate::scheduler::SchedulerRef;
use crate::{AggregateError, Error};
use std::{cell::RefCell, rc::Rc};

/// Outcome record produced by [`Promise::all_settled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settled<T, E> {
    pub fn state(&self) -> PromiseState {
        match self {
            Self::Fulfilled(_) => PromiseState::Fulfilled,
            Self::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Fulfilled(value) => Ok(value),
            Self::Rejected(reason) => Err(reason),
        }
    }
}

impl<T, E> From<Result<T, E>> for Settled<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Fulfilled(value),
            Err(reason) => Self::Rejected(reason),
        }
    }
}

/// Index-aligned accumulator shared by an operation's callbacks.
struct Tally<S> {
    slots: Vec<Option<S>>,
    remaining: usize,
}

impl<S> Tally<S> {
    fn shared(len: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            slots: (0..len).map(|_| None).collect(),
            remaining: len,
        }))
    }

    /// Stores the item for `index`; returns every item once all slots are filled.
    fn record(&mut self, index: usize, item: S) -> Option<Vec<S>> {
        if self.slots[index].replace(item).is_none() {
            self.remaining -= 1;
        }
        if self.remaining > 0 {
            return None;
        }
        Some(self.slots.iter_mut().filter_map(Option::take).collect())
    }
}

fn promises<T, E, I>(scheduler: &SchedulerRef, operands: I) -> Vec<Promise<T, E>>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
    I: IntoIterator,
    I::Item: Into<Resolution<T, E>>,
{
    operands
        .into_iter()
        .map(|operand| match operand.into() {
            Resolution::Promise(promise) => promise,
            other => Promise::resolve_with(scheduler, other),
        })
        .collect()
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Fulfills with every value, in operand order, once all operands have
    /// fulfilled. Rejects with the first rejection to happen.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_cell::{MicrotaskQueue, Promise, Resolution};
    /// let queue = MicrotaskQueue::new();
    /// let s = queue.scheduler();
    /// let later = Promise::<i32, String>::resolve(&s, 1)
    ///     .and_then(|v| Ok(Resolution::Value(v * 10)));
    /// let all = Promise::<i32, String>::all(&s, vec![later.into(), Resolution::Value(2)]);
    /// assert_eq!(queue.run_until_settled(&all), Ok(Ok(vec![10, 2])));
    /// ```
    pub fn all<I>(scheduler: &SchedulerRef, operands: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let operands = promises(scheduler, operands);
        let (resolver, output) = Promise::<Vec<T>, E>::with_resolvers(scheduler);
        tracing::trace!(operands = operands.len(), "all");
        if operands.is_empty() {
            resolver.fulfill(Vec::new());
            return output;
        }
        let tally = Tally::shared(operands.len());
        for (index, operand) in operands.into_iter().enumerate() {
            let (tally, fulfilling, rejecting) = (tally.clone(), resolver.clone(), resolver.clone());
            operand.subscribe(
                output.link(),
                move |value| {
                    let done = tally.borrow_mut().record(index, value);
                    if let Some(values) = done {
                        fulfilling.fulfill(values);
                    }
                },
                move |reason| rejecting.reject(reason),
            );
        }
        output
    }

    /// Fulfills, never rejects, with one [`Settled`] record per operand once
    /// every operand has settled.
    pub fn all_settled<I>(scheduler: &SchedulerRef, operands: I) -> Promise<Vec<Settled<T, E>>, E>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let operands = promises(scheduler, operands);
        let (resolver, output) = Promise::<Vec<Settled<T, E>>, E>::with_resolvers(scheduler);
        tracing::trace!(operands = operands.len(), "all_settled");
        if operands.is_empty() {
            resolver.fulfill(Vec::new());
            return output;
        }
        let tally = Tally::shared(operands.len());
        for (index, operand) in operands.into_iter().enumerate() {
            let (on_value, on_reason) = (tally.clone(), tally.clone());
            let (fulfilling, also_fulfilling) = (resolver.clone(), resolver.clone());
            operand.subscribe(
                output.link(),
                move |value| {
                    let done = on_value.borrow_mut().record(index, Settled::Fulfilled(value));
                    if let Some(records) = done {
                        fulfilling.fulfill(records);
                    }
                },
                move |reason| {
                    let done = on_reason.borrow_mut().record(index, Settled::Rejected(reason));
                    if let Some(records) = done {
                        also_fulfilling.fulfill(records);
                    }
                },
            );
        }
        output
    }

    /// Fulfills with the first operand to fulfill. Rejects with an
    /// [`AggregateError`] holding every reason, in operand order, once all
    /// operands have rejected; immediately when there are none.
    pub fn any<I>(scheduler: &SchedulerRef, operands: I) -> Promise<T, AggregateError<E>>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let operands = promises(scheduler, operands);
        let (resolver, output) = Promise::<T, AggregateError<E>>::with_resolvers(scheduler);
        tracing::trace!(operands = operands.len(), "any");
        if operands.is_empty() {
            resolver.reject(AggregateError::new(Vec::new()));
            return output;
        }
        let tally = Tally::shared(operands.len());
        for (index, operand) in operands.into_iter().enumerate() {
            let (tally, fulfilling, rejecting) = (tally.clone(), resolver.clone(), resolver.clone());
            operand.subscribe(
                output.link(),
                move |value| fulfilling.fulfill(value),
                move |reason| {
                    let done = tally.borrow_mut().record(index, reason);
                    if let Some(errors) = done {
                        rejecting.reject(AggregateError::new(errors));
                    }
                },
            );
        }
        output
    }

    /// Settles like whichever operand settles first. With no operands the
    /// result stays pending forever.
    pub fn race<I>(scheduler: &SchedulerRef, operands: I) -> Promise<T, E>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let operands = promises(scheduler, operands);
        let (resolver, output) = Promise::<T, E>::with_resolvers(scheduler);
        tracing::trace!(operands = operands.len(), "race");
        for operand in operands {
            let (fulfilling, rejecting) = (resolver.clone(), resolver.clone());
            operand.subscribe(
                output.link(),
                move |value| fulfilling.fulfill(value),
                move |reason| rejecting.reject(reason),
            );
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MicrotaskQueue;

    type P<T> = Promise<T, String>;
    type R = Resolution<i32, String>;

    fn setup() -> (MicrotaskQueue, SchedulerRef) {
        let queue = MicrotaskQueue::new();
        let scheduler = queue.scheduler();
        (queue, scheduler)
    }

    fn ok(s: &SchedulerRef, value: i32) -> R {
        P::<i32>::resolve(s, value).into()
    }

    fn err(s: &SchedulerRef, reason: &str) -> R {
        P::<i32>::reject(s, reason.to_string()).into()
    }

    /// A promise that settles after `turns` extra scheduler turns.
    fn delayed(s: &SchedulerRef, turns: usize, outcome: Result<i32, String>) -> P<i32> {
        let mut p = P::<i32>::resolve(s, 0);
        for _ in 0..turns {
            p = p.and_then(|v| Ok(Resolution::Value(v)));
        }
        p.and_then(move |_| outcome.map(Resolution::Value))
    }

    #[test]
    fn tally_reports_once_full() {
        let tally = Tally::shared(2);
        assert_eq!(tally.borrow_mut().record(1, "b"), None);
        assert_eq!(tally.borrow_mut().record(0, "a"), Some(vec!["a", "b"]));
    }

    #[test]
    fn all_keeps_operand_order() {
        let (queue, s) = setup();
        let ops = vec![delayed(&s, 3, Ok(1)).into(), R::Value(2), delayed(&s, 1, Ok(3)).into()];
        let all = P::<i32>::all(&s, ops);
        assert_eq!(queue.run_until_settled(&all), Ok(Ok(vec![1, 2, 3])));
    }

    #[test]
    fn all_rejects_with_the_first_rejection() {
        let (queue, s) = setup();
        let ops = vec![R::Value(1), ok(&s, 2), err(&s, "3"), ok(&s, 4)];
        let all = P::<i32>::all(&s, ops);
        assert_eq!(queue.run_until_settled(&all), Ok(Err("3".to_string())));

        let ops = vec![delayed(&s, 4, Err("slow".into())), delayed(&s, 1, Err("fast".into()))];
        let all = P::<i32>::all(&s, ops);
        assert_eq!(queue.run_until_settled(&all), Ok(Err("fast".to_string())));
    }

    #[test]
    fn all_of_nothing_fulfills_immediately() {
        let (_queue, s) = setup();
        let all = P::<i32>::all(&s, Vec::<R>::new());
        assert_eq!(all.peek(), Some(Ok(vec![])));
    }

    #[test]
    fn all_settled_records_each_outcome() {
        let (queue, s) = setup();
        let ops = vec![R::Value(1), err(&s, "e")];
        let settled = P::<i32>::all_settled(&s, ops);
        assert_eq!(
            queue.run_until_settled(&settled),
            Ok(Ok(vec![Settled::Fulfilled(1), Settled::Rejected("e".to_string())]))
        );
    }

    #[test]
    fn all_settled_of_nothing_fulfills_immediately() {
        let (_queue, s) = setup();
        let settled = P::<i32>::all_settled(&s, Vec::<R>::new());
        assert_eq!(settled.peek(), Some(Ok(vec![])));
    }

    #[test]
    fn any_takes_the_first_fulfillment() {
        let (queue, s) = setup();
        let ops = vec![delayed(&s, 3, Ok(1)), delayed(&s, 0, Err("no".into())), delayed(&s, 1, Ok(2))];
        let any = P::<i32>::any(&s, ops);
        assert_eq!(queue.run_until_settled(&any), Ok(Ok(2)));
    }

    #[test]
    fn any_aggregates_every_reason_in_order() {
        let (queue, s) = setup();
        let ops = vec![delayed(&s, 2, Err("a".into())), delayed(&s, 0, Err("b".into()))];
        let any = P::<i32>::any(&s, ops);
        assert_eq!(
            queue.run_until_settled(&any),
            Ok(Err(AggregateError::new(vec!["a".to_string(), "b".to_string()])))
        );
    }

    #[test]
    fn any_of_nothing_rejects_immediately() {
        let (_queue, s) = setup();
        let any = P::<i32>::any(&s, Vec::<R>::new());
        assert_eq!(any.peek(), Some(Err(AggregateError::new(vec![]))));
    }

    #[test]
    fn race_follows_completion_order() {
        let (queue, s) = setup();
        let race = P::<i32>::race(&s, vec![ok(&s, 1), err(&s, "x")]);
        assert_eq!(queue.run_until_settled(&race), Ok(Ok(1)));

        let race = P::<i32>::race(&s, vec![delayed(&s, 3, Ok(1)), delayed(&s, 1, Err("x".into()))]);
        assert_eq!(queue.run_until_settled(&race), Ok(Err("x".to_string())));
    }

    #[test]
    fn race_of_nothing_never_settles() {
        let (queue, s) = setup();
        let race = P::<i32>::race(&s, Vec::<R>::new());
        assert_eq!(queue.run_until_settled(&race), Err(Error::Stalled));
        assert!(race.is_pending());
    }

    #[test]
    fn settled_record_helpers() {
        let record: Settled<i32, String> = Err("e".to_string()).into();
        assert_eq!(record.state(), PromiseState::Rejected);
        assert_eq!(record.into_result(), Err("e".to_string()));
        assert_eq!(Settled::<i32, String>::Fulfilled(1).state(), PromiseState::Fulfilled);
    }
}
