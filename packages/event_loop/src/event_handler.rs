use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::ERR_POISONED_LOCK;
use crate::dump::Dumper;
use crate::error::{Error, Result};
use crate::event_runner::EventRunner;
use crate::fd_listener::{FdEvents, FileDescriptorListener};
use crate::inner_event::InnerEvent;
use crate::priority::Priority;

thread_local! {
    /// The handler whose event is being dispatched on this thread, if any.
    /// Scoped to the dispatch call and restored on return, so nested
    /// same-thread synchronous sends see the right value at every depth.
    static CURRENT_HANDLER: RefCell<Option<Weak<EventHandler>>> = const { RefCell::new(None) };
}

type ProcessCallback = Box<dyn Fn(&InnerEvent) + Send + Sync>;

/// Facade through which callers submit and receive events against a runner.
///
/// A handler stamps ownership and timing onto every event it submits, so the
/// queue can later remove exactly this handler's entries and never dispatch
/// work for a handler that no longer exists. Many handlers may share one
/// runner.
///
/// Id-bearing events are delivered to the *process callback* supplied at
/// construction ([`with_processor`](Self::with_processor)); task events run
/// their closure directly. Dropping a handler purges everything it still has
/// queued, including its file descriptor listeners.
pub struct EventHandler {
    event_runner: Option<Arc<EventRunner>>,
    processor: Option<ProcessCallback>,
    delivery_timeout: Mutex<Duration>,
    distribution_timeout: Mutex<Duration>,
    self_weak: Weak<EventHandler>,
}

impl EventHandler {
    fn build(
        event_runner: Option<Arc<EventRunner>>,
        processor: Option<ProcessCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            event_runner,
            processor,
            delivery_timeout: Mutex::new(Duration::ZERO),
            distribution_timeout: Mutex::new(Duration::ZERO),
            self_weak: self_weak.clone(),
        })
    }

    /// Creates a handler bound to `runner`, with a no-op process callback.
    #[must_use]
    pub fn new(runner: Arc<EventRunner>) -> Arc<Self> {
        Self::build(Some(runner), None)
    }

    /// Creates a handler bound to `runner` that delivers every dequeued
    /// id-bearing event to `processor`.
    #[must_use]
    pub fn with_processor<F>(runner: Arc<EventRunner>, processor: F) -> Arc<Self>
    where
        F: Fn(&InnerEvent) + Send + Sync + 'static,
    {
        Self::build(Some(runner), Some(Box::new(processor)))
    }

    /// Creates a handler bound to the calling thread's runner.
    ///
    /// # Errors
    ///
    /// [`Error::NoEventRunner`] when the calling thread is not inside a
    /// runner's loop.
    pub fn for_current_thread() -> Result<Arc<Self>> {
        let runner = EventRunner::current().ok_or(Error::NoEventRunner)?;
        Ok(Self::build(Some(runner), None))
    }

    /// Like [`for_current_thread`](Self::for_current_thread), with a process
    /// callback.
    ///
    /// # Errors
    ///
    /// [`Error::NoEventRunner`] when the calling thread is not inside a
    /// runner's loop.
    pub fn for_current_thread_with_processor<F>(processor: F) -> Result<Arc<Self>>
    where
        F: Fn(&InnerEvent) + Send + Sync + 'static,
    {
        let runner = EventRunner::current().ok_or(Error::NoEventRunner)?;
        Ok(Self::build(Some(runner), Some(Box::new(processor))))
    }

    /// Creates a handler bound to no runner. Every submission fails with
    /// [`Error::NoEventRunner`]; removals are no-ops. Useful as a pure owner
    /// identity, e.g. in tests.
    #[must_use]
    pub fn detached() -> Arc<Self> {
        Self::build(None, None)
    }

    /// The handler whose event is being dispatched on the calling thread.
    #[must_use]
    pub fn current() -> Option<Arc<EventHandler>> {
        CURRENT_HANDLER.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// The runner this handler is bound to.
    #[must_use]
    pub fn event_runner(&self) -> Option<&Arc<EventRunner>> {
        self.event_runner.as_ref()
    }

    fn bound_runner(&self) -> Result<&Arc<EventRunner>> {
        self.event_runner.as_ref().ok_or(Error::NoEventRunner)
    }

    fn stamp_and_insert(&self, runner: &Arc<EventRunner>, mut event: Box<InnerEvent>, priority: Priority) {
        event.set_owner(self.self_weak.clone());
        if let Some(trace_id) = event.get_or_create_trace_id() {
            log::debug!("sending event `{}` (trace {trace_id})", event.name());
        }
        runner.queue().insert(event, priority);
    }

    /// Submits `event` to fire after `delay`. Never blocks.
    ///
    /// # Errors
    ///
    /// [`Error::NoEventRunner`] when no runner is bound.
    pub fn send_event(
        &self,
        mut event: Box<InnerEvent>,
        delay: Duration,
        priority: Priority,
    ) -> Result<()> {
        let runner = self.bound_runner()?;

        let now = Instant::now();
        event.set_send_time(now);
        event.set_handle_time(now + delay);

        self.stamp_and_insert(runner, event, priority);
        Ok(())
    }

    /// Submits `event` to fire at the absolute time `at`. A time already in
    /// the past fires immediately; it is never replayed.
    ///
    /// # Errors
    ///
    /// [`Error::NoEventRunner`] when no runner is bound.
    pub fn send_timing_event(
        &self,
        mut event: Box<InnerEvent>,
        at: Instant,
        priority: Priority,
    ) -> Result<()> {
        let runner = self.bound_runner()?;

        let now = Instant::now();
        event.set_send_time(now);
        event.set_handle_time(at.max(now));

        self.stamp_and_insert(runner, event, priority);
        Ok(())
    }

    /// Submits `event` and blocks until the target runner's thread has
    /// finished processing it.
    ///
    /// When the caller is already inside the target runner's own loop, the
    /// event is dispatched inline immediately instead; that reentrant fast
    /// path makes same-thread synchronous sends deadlock-free. Across
    /// runners no such protection exists: a cycle of synchronous sends
    /// between two runners deadlocks both, and it is on the caller to avoid
    /// that. This is the only call in the subsystem that can block without
    /// bound.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] for [`Priority::Idle`] (there is no bounded
    /// answer to "when does idle work run"); [`Error::NoEventRunner`] when no
    /// runner is bound or the target runner is not running, since failing
    /// fast beats blocking on a loop that will never dispatch.
    pub fn send_sync_event(&self, mut event: Box<InnerEvent>, priority: Priority) -> Result<()> {
        if priority == Priority::Idle {
            return Err(Error::InvalidParam {
                reason: "synchronous events cannot use idle priority".to_string(),
            });
        }

        let runner = self.bound_runner()?;
        if !runner.is_running() {
            return Err(Error::NoEventRunner);
        }

        if runner.is_in_current_thread() {
            let now = Instant::now();
            event.set_send_time(now);
            event.set_handle_time(now);
            event.set_owner(self.self_weak.clone());
            self.distribute(event);
            return Ok(());
        }

        let waiter = event.create_waiter();
        self.send_event(event, Duration::ZERO, priority)?;
        waiter.wait();
        Ok(())
    }

    /// Submits an unnamed task closure to run after `delay`.
    ///
    /// # Errors
    ///
    /// [`Error::NoEventRunner`] when no runner is bound.
    pub fn post_task<F>(&self, task: F, delay: Duration, priority: Priority) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_event(InnerEvent::with_task(task, String::new()), delay, priority)
    }

    /// Submits a named task closure to run after `delay`; the name is the
    /// removal key for [`remove_task`](Self::remove_task).
    ///
    /// # Errors
    ///
    /// [`Error::NoEventRunner`] when no runner is bound.
    pub fn post_named_task<F>(
        &self,
        task: F,
        name: impl Into<String>,
        delay: Duration,
        priority: Priority,
    ) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_event(InnerEvent::with_task(task, name), delay, priority)
    }

    /// Removes every not-yet-dispatched event this handler submitted.
    /// Already-dequeued events are committed and unaffected.
    pub fn remove_all_events(&self) {
        if let Some(runner) = &self.event_runner {
            runner.queue().remove_all_for(&self.self_weak);
        }
    }

    /// Removes this handler's not-yet-dispatched events with the given id.
    pub fn remove_event(&self, id: u32) {
        if let Some(runner) = &self.event_runner {
            runner.queue().remove(&self.self_weak, id);
        }
    }

    /// Removes this handler's not-yet-dispatched events matching both id and
    /// param.
    pub fn remove_event_with_param(&self, id: u32, param: i64) {
        if let Some(runner) = &self.event_runner {
            runner.queue().remove_with_param(&self.self_weak, id, param);
        }
    }

    /// Removes this handler's not-yet-dispatched tasks whose name matches
    /// `name` exactly.
    pub fn remove_task(&self, name: &str) {
        if let Some(runner) = &self.event_runner {
            runner.queue().remove_task(&self.self_weak, name);
        }
    }

    /// Whether the bound queue still holds an id-bearing event with this id,
    /// from any owner. Diagnostic only.
    #[must_use]
    pub fn has_inner_event(&self, id: u32) -> bool {
        self.event_runner
            .as_ref()
            .is_some_and(|runner| runner.queue().has_event_with_id(id))
    }

    /// Whether the bound queue still holds an id-bearing event with this
    /// param, from any owner. Diagnostic only.
    #[must_use]
    pub fn has_inner_event_with_param(&self, param: i64) -> bool {
        self.event_runner
            .as_ref()
            .is_some_and(|runner| runner.queue().has_event_with_param(param))
    }

    /// Registers `listener` for readiness of `fd` on the bound queue, owned
    /// by this handler.
    ///
    /// # Errors
    ///
    /// [`Error::NoEventRunner`] when no runner is bound; otherwise the bound
    /// queue's registration errors
    /// (see [`EventQueue::add_file_descriptor_listener`][add]).
    ///
    /// [add]: crate::EventQueue::add_file_descriptor_listener
    pub fn add_file_descriptor_listener(
        &self,
        fd: i32,
        events: FdEvents,
        listener: Arc<dyn FileDescriptorListener>,
    ) -> Result<()> {
        let runner = self.bound_runner()?;
        runner
            .queue()
            .add_file_descriptor_listener(fd, events, listener, self.self_weak.clone())
    }

    /// Unregisters the listener for `fd` on the bound queue, whoever owns it.
    pub fn remove_file_descriptor_listener(&self, fd: i32) {
        if let Some(runner) = &self.event_runner {
            runner.queue().remove_file_descriptor_listener(fd);
        }
    }

    /// Unregisters every listener this handler owns on the bound queue.
    pub fn remove_all_file_descriptor_listeners(&self) {
        if let Some(runner) = &self.event_runner {
            runner
                .queue()
                .remove_file_descriptor_listeners_for(&self.self_weak);
        }
    }

    /// Whether the bound queue currently has no ready realtime work.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.event_runner
            .as_ref()
            .is_none_or(|runner| runner.queue().is_idle())
    }

    /// Sets the delivery latency threshold: dispatch starting more than this
    /// long after an event's scheduled time logs a warning. Zero (the
    /// default) disables the check. Diagnostic only; execution is unaffected.
    pub fn set_delivery_timeout(&self, timeout: Duration) {
        *self.delivery_timeout.lock().expect(ERR_POISONED_LOCK) = timeout;
    }

    /// Sets the distribution duration threshold: processing that takes longer
    /// than this logs a warning. Zero (the default) disables the check.
    /// Diagnostic only; execution is unaffected.
    pub fn set_distribution_timeout(&self, timeout: Duration) {
        *self.distribution_timeout.lock().expect(ERR_POISONED_LOCK) = timeout;
    }

    /// Dispatches one dequeued event on behalf of the runner loop: runs the
    /// task closure, or hands an id-bearing event to the process callback.
    /// Only ever called on the owning runner's thread.
    pub(crate) fn distribute(&self, mut event: Box<InnerEvent>) {
        let previous =
            CURRENT_HANDLER.with(|slot| slot.borrow_mut().replace(self.self_weak.clone()));
        let _restore = scopeguard::guard(previous, |previous| {
            CURRENT_HANDLER.with(|slot| *slot.borrow_mut() = previous);
        });

        let started = Instant::now();

        let delivery_timeout = *self.delivery_timeout.lock().expect(ERR_POISONED_LOCK);
        if !delivery_timeout.is_zero() {
            let lateness = started.saturating_duration_since(event.handle_time());
            if lateness > delivery_timeout {
                log::warn!(
                    "event `{}` started {lateness:?} after its scheduled time (threshold {delivery_timeout:?})",
                    event.name()
                );
            }
        }

        if let Some(task) = event.take_task() {
            task();
        } else if let Some(processor) = &self.processor {
            processor(&event);
        }

        let distribution_timeout = *self.distribution_timeout.lock().expect(ERR_POISONED_LOCK);
        if !distribution_timeout.is_zero() {
            let elapsed = started.elapsed();
            if elapsed > distribution_timeout {
                log::warn!(
                    "event `{}` took {elapsed:?} to process (threshold {distribution_timeout:?})",
                    event.name()
                );
            }
        }

        // `event` drops here: an attached waiter (synchronous send) fires now.
    }

    /// Writes this handler's binding and its queue's contents into `dumper`.
    pub fn dump(&self, dumper: &mut dyn Dumper) {
        let tag = dumper.tag().to_string();
        match &self.event_runner {
            Some(runner) => {
                dumper.dump(&format!(
                    "{tag} handler bound to runner `{}`",
                    runner.thread_name().unwrap_or("unnamed")
                ));
                runner.queue().dump(dumper);
            }
            None => dumper.dump(&format!("{tag} handler is not bound to a runner")),
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("bound", &self.event_runner.is_some())
            .field("has_processor", &self.processor.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        if let Some(runner) = &self.event_runner {
            // Our weak self is already unupgradable here, so the orphan purge
            // sweeps exactly what this handler still had queued or
            // registered.
            runner.queue().remove_orphans();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(EventHandler: Send, Sync, Debug);

    #[test]
    fn detached_handler_rejects_submissions() {
        let handler = EventHandler::detached();

        assert!(matches!(
            handler.send_event(InnerEvent::new(1), Duration::ZERO, Priority::Low),
            Err(Error::NoEventRunner)
        ));
        assert!(matches!(
            handler.post_task(|| {}, Duration::ZERO, Priority::Low),
            Err(Error::NoEventRunner)
        ));

        // Removals and scans on a detached handler are quiet no-ops.
        handler.remove_all_events();
        handler.remove_event(1);
        assert!(!handler.has_inner_event(1));
        assert!(handler.is_idle());
    }

    #[test]
    fn sync_send_rejects_idle_priority() {
        let handler = EventHandler::detached();
        assert!(matches!(
            handler.send_sync_event(InnerEvent::new(1), Priority::Idle),
            Err(Error::InvalidParam { .. })
        ));
    }

    #[test]
    fn sync_send_fails_fast_when_runner_is_not_running() {
        let runner = EventRunner::new();
        let handler = EventHandler::new(runner);

        assert!(matches!(
            handler.send_sync_event(InnerEvent::new(1), Priority::High),
            Err(Error::NoEventRunner)
        ));
    }

    #[test]
    fn current_is_none_outside_dispatch() {
        assert!(EventHandler::current().is_none());
    }

    #[test]
    fn fd_listener_on_detached_handler_fails() {
        struct Quiet;
        impl crate::FileDescriptorListener for Quiet {}

        let handler = EventHandler::detached();
        assert!(matches!(
            handler.add_file_descriptor_listener(0, FdEvents::READABLE, Arc::new(Quiet)),
            Err(Error::NoEventRunner)
        ));
    }
}
