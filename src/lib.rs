//! Single-threaded promises with an injectable scheduler.
//!
//! A [`Promise`] is settled once, through its [`Resolver`], and observers
//! chain continuations onto it with [`Promise::then`]. Continuations never
//! run synchronously: they are queued on a [`Scheduler`], normally a
//! [`MicrotaskQueue`] that the caller drives.
//!
//! ```
//! use promise_cell::{MicrotaskQueue, Promise, Resolution};
//!
//! let queue = MicrotaskQueue::new();
//! let s = queue.scheduler();
//! let (resolver, promise) = Promise::<i32, String>::with_resolvers(&s);
//! let doubled = promise.and_then(|v| Ok(Resolution::Value(v * 2)));
//!
//! resolver.fulfill(21);
//! assert!(doubled.is_pending());
//! queue.run_until_idle().unwrap();
//! assert_eq!(doubled.peek(), Some(Ok(42)));
//! ```
//!
pub mod combinators;
pub mod error;
pub mod promise;
pub mod resolution;
pub mod scheduler;

pub use combinators::Settled;
pub use error::{AggregateError, Error};
pub use promise::{Promise, PromiseState, Resolver};
pub use resolution::{Resolution, Thenable};
pub use scheduler::{MicrotaskQueue, QueueConfig, Scheduler, SchedulerRef, Task};
