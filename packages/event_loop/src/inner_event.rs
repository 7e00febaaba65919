use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::event_handler::EventHandler;
use crate::waiter::Waiter;

/// Source of lazily assigned trace ids; zero is never handed out.
static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased payload carried by an event, with the ownership mode chosen by
/// the producer.
enum Payload {
    /// The event owns the value; the consumer takes it out exactly once.
    Unique(Box<dyn Any + Send>),

    /// Ownership is shared between producer and consumer.
    Shared(Arc<dyn Any + Send + Sync>),

    /// The event merely observes a value that may be gone by dispatch time.
    Observed(Weak<dyn Any + Send + Sync>),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unique(_) => f.write_str("Unique"),
            Self::Shared(_) => f.write_str("Shared"),
            Self::Observed(_) => f.write_str("Observed"),
        }
    }
}

/// One unit of deferred work or one message, as held by an event queue.
///
/// An event is either *id-bearing* (created from an event id plus an optional
/// correlation parameter and payload, delivered to its handler's process
/// callback) or *task-bearing* (created from a closure plus a name, executed
/// directly by the dispatch loop). Id-bearing events are removed by id/param;
/// task-bearing events are removed by name.
///
/// Events travel boxed. The queue orders them by
/// [`handle_time`](Self::handle_time), which is never earlier than
/// [`send_time`](Self::send_time): senders stamp both.
pub struct InnerEvent {
    id: u32,
    param: i64,
    payload: Option<Payload>,
    task: Option<Box<dyn FnOnce() + Send>>,
    task_name: String,
    owner: Weak<EventHandler>,
    send_time: Instant,
    handle_time: Instant,
    trace_id: Option<u64>,
    waiter: Option<Arc<Waiter>>,
}

impl InnerEvent {
    fn bare(id: u32, param: i64) -> Box<Self> {
        let now = Instant::now();

        Box::new(Self {
            id,
            param,
            payload: None,
            task: None,
            task_name: String::new(),
            owner: Weak::new(),
            send_time: now,
            handle_time: now,
            trace_id: None,
            waiter: None,
        })
    }

    /// Creates an id-bearing event.
    #[must_use]
    pub fn new(id: u32) -> Box<Self> {
        Self::bare(id, 0)
    }

    /// Creates an id-bearing event with a correlation parameter.
    #[must_use]
    pub fn with_param(id: u32, param: i64) -> Box<Self> {
        Self::bare(id, param)
    }

    /// Creates an id-bearing event that owns `payload`; the consumer takes it
    /// out with [`take_unique_payload`](Self::take_unique_payload).
    #[must_use]
    pub fn with_unique_payload<P>(id: u32, payload: P, param: i64) -> Box<Self>
    where
        P: Any + Send,
    {
        let mut event = Self::bare(id, param);
        event.payload = Some(Payload::Unique(Box::new(payload)));
        event
    }

    /// Creates an id-bearing event sharing ownership of `payload` with the
    /// producer.
    #[must_use]
    pub fn with_shared_payload<P>(id: u32, payload: Arc<P>, param: i64) -> Box<Self>
    where
        P: Any + Send + Sync,
    {
        let mut event = Self::bare(id, param);
        event.payload = Some(Payload::Shared(payload));
        event
    }

    /// Creates an id-bearing event that observes `payload` without keeping it
    /// alive; [`observed_payload`](Self::observed_payload) returns `None` if
    /// the value is gone by dispatch time.
    #[must_use]
    pub fn with_observed_payload<P>(id: u32, payload: &Arc<P>, param: i64) -> Box<Self>
    where
        P: Any + Send + Sync,
    {
        let weak_p = Arc::downgrade(payload);
        let weak: Weak<dyn Any + Send + Sync> = weak_p;
        let mut event = Self::bare(id, param);
        event.payload = Some(Payload::Observed(weak));
        event
    }

    /// Creates a task-bearing event. Task events are anonymous (id 0) and are
    /// removed by exact `name` match.
    #[must_use]
    pub fn with_task<F>(task: F, name: impl Into<String>) -> Box<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut event = Self::bare(0, 0);
        event.task = Some(Box::new(task));
        event.task_name = name.into();
        event
    }

    /// The event id; 0 means anonymous (every task event is anonymous).
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The correlation parameter supplied at creation.
    #[must_use]
    pub fn param(&self) -> i64 {
        self.param
    }

    /// Whether the event carries a task closure.
    #[must_use]
    pub fn has_task(&self) -> bool {
        self.task.is_some()
    }

    /// The task name, empty for unnamed tasks and id-bearing events.
    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// When the event was submitted.
    #[must_use]
    pub fn send_time(&self) -> Instant {
        self.send_time
    }

    /// Sets the submission time.
    pub fn set_send_time(&mut self, send_time: Instant) {
        self.send_time = send_time;
    }

    /// When the event becomes eligible for dispatch.
    #[must_use]
    pub fn handle_time(&self) -> Instant {
        self.handle_time
    }

    /// Sets the scheduled dispatch time.
    pub fn set_handle_time(&mut self, handle_time: Instant) {
        self.handle_time = handle_time;
    }

    /// A short name for log and dump lines: the task name for task events,
    /// the event id otherwise.
    #[must_use]
    pub fn name(&self) -> String {
        if self.has_task() {
            self.task_name.clone()
        } else {
            self.id.to_string()
        }
    }

    /// Takes a uniquely owned payload out of the event. Returns `None` when
    /// there is no payload, it was created with another ownership mode, or
    /// `P` is not its type; in those cases the payload stays in place.
    pub fn take_unique_payload<P: Any>(&mut self) -> Option<Box<P>> {
        match self.payload.take()? {
            Payload::Unique(boxed) => match boxed.downcast::<P>() {
                Ok(value) => Some(value),
                Err(boxed) => {
                    self.payload = Some(Payload::Unique(boxed));
                    None
                }
            },
            other => {
                self.payload = Some(other);
                None
            }
        }
    }

    /// A shared payload of type `P`, if the event carries one.
    pub fn shared_payload<P: Any + Send + Sync>(&self) -> Option<Arc<P>> {
        match self.payload.as_ref()? {
            Payload::Shared(shared) => Arc::clone(shared).downcast::<P>().ok(),
            _ => None,
        }
    }

    /// An observed payload of type `P`, if the event carries one and the
    /// observed value is still alive.
    pub fn observed_payload<P: Any + Send + Sync>(&self) -> Option<Arc<P>> {
        match self.payload.as_ref()? {
            Payload::Observed(weak) => weak.upgrade()?.downcast::<P>().ok(),
            _ => None,
        }
    }

    /// The trace id, lazily assigned by
    /// [`get_or_create_trace_id`](Self::get_or_create_trace_id).
    #[must_use]
    pub fn trace_id(&self) -> Option<u64> {
        self.trace_id
    }

    /// Assigns a trace id for correlating log lines about this event. Outside
    /// a tracing context (debug logging disabled) this does nothing and
    /// returns `None`.
    pub fn get_or_create_trace_id(&mut self) -> Option<u64> {
        if self.trace_id.is_none() && log::log_enabled!(log::Level::Debug) {
            self.trace_id = Some(NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed));
        }

        self.trace_id
    }

    pub(crate) fn owner(&self) -> &Weak<EventHandler> {
        &self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Weak<EventHandler>) {
        self.owner = owner;
    }

    pub(crate) fn take_task(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
        self.task.take()
    }

    /// Attaches the event's one blocking handle, creating it on first use.
    /// Only synchronous sends do this.
    pub(crate) fn create_waiter(&mut self) -> Arc<Waiter> {
        Arc::clone(
            self.waiter
                .get_or_insert_with(|| Arc::new(Waiter::new())),
        )
    }
}

impl fmt::Debug for InnerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerEvent")
            .field("id", &self.id)
            .field("param", &self.param)
            .field("payload", &self.payload)
            .field("task", &self.task.as_ref().map(|_| &self.task_name))
            .field("send_time", &self.send_time)
            .field("handle_time", &self.handle_time)
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}

impl Drop for InnerEvent {
    fn drop(&mut self) {
        // Fires whether the event was dispatched or removed, so a blocked
        // synchronous sender is always released.
        if let Some(waiter) = self.waiter.take() {
            waiter.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(InnerEvent: Send);

    #[test]
    fn id_events_have_no_task() {
        let event = InnerEvent::with_param(3, 17);
        assert_eq!(event.id(), 3);
        assert_eq!(event.param(), 17);
        assert!(!event.has_task());
        assert_eq!(event.name(), "3");
    }

    #[test]
    fn task_events_are_anonymous_and_named() {
        let event = InnerEvent::with_task(|| {}, "refresh");
        assert_eq!(event.id(), 0);
        assert!(event.has_task());
        assert_eq!(event.name(), "refresh");
    }

    #[test]
    fn unique_payload_round_trips_once() {
        let mut event = InnerEvent::with_unique_payload(1, String::from("cargo"), 0);

        // A wrongly typed request leaves the payload untouched.
        assert!(event.take_unique_payload::<u32>().is_none());

        let payload = event.take_unique_payload::<String>().unwrap();
        assert_eq!(*payload, "cargo");
        assert!(event.take_unique_payload::<String>().is_none());
    }

    #[test]
    fn shared_payload_is_cloneable() {
        let value = Arc::new(42_u32);
        let event = InnerEvent::with_shared_payload(1, Arc::clone(&value), 0);

        assert_eq!(*event.shared_payload::<u32>().unwrap(), 42);
        assert_eq!(*event.shared_payload::<u32>().unwrap(), 42);
        assert!(event.shared_payload::<String>().is_none());
    }

    #[test]
    fn observed_payload_expires_with_its_owner() {
        let value = Arc::new(7_u32);
        let event = InnerEvent::with_observed_payload(1, &value, 0);

        assert_eq!(*event.observed_payload::<u32>().unwrap(), 7);

        drop(value);
        assert!(event.observed_payload::<u32>().is_none());
    }

    #[test]
    fn handle_time_is_settable() {
        let mut event = InnerEvent::new(1);
        let later = Instant::now() + std::time::Duration::from_millis(250);
        event.set_handle_time(later);
        assert_eq!(event.handle_time(), later);
    }

    #[test]
    fn waiter_is_created_once() {
        let mut event = InnerEvent::new(1);
        let first = event.create_waiter();
        let second = event.create_waiter();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn dropping_an_event_releases_its_waiter() {
        let mut event = InnerEvent::new(1);
        let waiter = event.create_waiter();
        drop(event);

        // Returns immediately because drop already notified.
        waiter.wait();
    }

    #[test]
    fn trace_id_is_noop_without_tracing() {
        // No logger is installed in unit tests, so debug logging is disabled.
        let mut event = InnerEvent::new(1);
        assert_eq!(event.get_or_create_trace_id(), None);
        assert_eq!(event.trace_id(), None);
    }
}
