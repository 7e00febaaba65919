//! Thread-confined event loop and priority task scheduler.
//!
//! An [`EventRunner`] owns one OS thread running a cooperative dispatch loop
//! over one [`EventQueue`]. Producers on any thread submit work through an
//! [`EventHandler`] bound to the runner: closures via
//! [`post_task`](EventHandler::post_task), messages via
//! [`send_event`](EventHandler::send_event) (delivered to the handler's
//! process callback), with four priorities, optional delays or absolute fire
//! times, and a blocking [`send_sync_event`](EventHandler::send_sync_event)
//! that returns once the owning thread has processed the event.
//!
//! The queue orders each priority bucket by scheduled time, avoids starving
//! low-priority work through bounded interleaving, sleeps exactly until the
//! next event is due, and can fold file descriptor readiness
//! ([`FileDescriptorListener`]) into the same wait.
//!
//! This is part of the [Weft project](https://github.com/weft-rs/weft) that
//! provides building blocks for thread-confined scheduling in Rust.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use event_loop::{EventHandler, EventRunner, Priority};
//!
//! let runner = EventRunner::spawn_named("worker");
//! let handler = EventHandler::new(runner);
//!
//! handler
//!     .post_task(|| println!("hello from the loop"), Duration::ZERO, Priority::Low)
//!     .unwrap();
//!
//! // Blocks until the worker thread has processed the event.
//! handler
//!     .send_sync_event(event_loop::InnerEvent::new(1), Priority::High)
//!     .unwrap();
//! ```

mod dump;
#[cfg(unix)]
mod epoll_io_waiter;
mod error;
mod event_handler;
mod event_queue;
mod event_runner;
mod fd_listener;
mod inner_event;
mod io_waiter;
mod priority;
mod waiter;

pub use dump::*;
pub use error::Error;
pub use event_handler::*;
pub use event_queue::*;
pub use event_runner::*;
pub use fd_listener::*;
pub use inner_event::*;
pub use priority::*;

// A poisoned lock means a thread panicked while mutating queue or runner
// state; dispatching from that state could run removed or reordered work, so
// we stop instead.
pub(crate) const ERR_POISONED_LOCK: &str = "internal lock poisoned - event loop \
    state may be corrupt and continuing could dispatch work that was cancelled";
