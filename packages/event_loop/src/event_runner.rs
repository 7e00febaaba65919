use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crate::ERR_POISONED_LOCK;
use crate::dump::Dumper;
use crate::error::{Error, Result};
use crate::event_queue::EventQueue;

thread_local! {
    /// The runner whose loop is executing on this thread, if any. One slot
    /// per OS thread, scoped to the loop and restored on exit.
    static CURRENT_RUNNER: RefCell<Option<Weak<EventRunner>>> = const { RefCell::new(None) };
}

#[derive(Debug, Default)]
struct RunnerInner {
    /// Thread the loop runs on: fixed at spawn for deposited runners,
    /// recorded at loop entry otherwise.
    loop_thread: Option<ThreadId>,
    join_handle: Option<JoinHandle<()>>,
}

/// Owner of one event loop bound to one thread.
///
/// A runner couples exactly one [`EventQueue`] with at most one OS thread
/// executing the dispatch loop. Two flavors exist:
///
/// - **Caller-driven** ([`new`](Self::new)): the caller picks the loop thread
///   by invoking [`run`](Self::run) on it, and ends the loop with
///   [`stop`](Self::stop).
/// - **Deposited** ([`spawn`](Self::spawn) / [`spawn_named`](Self::spawn_named)):
///   the runner owns an internally spawned thread that starts immediately.
///   Any thread may submit through handlers bound to it, but its loop
///   lifecycle is internal: `run`/`stop` from outside its own thread fail
///   [`Error::NoPermit`]. Dropping the last reference stops and joins it.
///
/// Work dispatched by the loop runs to completion before the next item is
/// considered; there is no preemption.
#[derive(Debug)]
pub struct EventRunner {
    queue: Arc<EventQueue>,
    deposited: bool,
    thread_name: Option<String>,
    running: AtomicBool,
    inner: Mutex<RunnerInner>,
    self_weak: Weak<EventRunner>,
}

impl EventRunner {
    /// Creates a caller-driven runner. Nothing executes until some thread
    /// calls [`run`](Self::run); events submitted before that are buffered.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            queue: Arc::new(EventQueue::new()),
            deposited: false,
            thread_name: None,
            running: AtomicBool::new(false),
            inner: Mutex::new(RunnerInner::default()),
            self_weak: self_weak.clone(),
        })
    }

    /// Creates a deposited runner on an unnamed internal thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    #[must_use]
    pub fn spawn() -> Arc<Self> {
        Self::spawn_inner(None)
    }

    /// Creates a deposited runner whose internal thread carries `name`.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    #[must_use]
    pub fn spawn_named(name: &str) -> Arc<Self> {
        Self::spawn_inner(Some(name.to_string()))
    }

    fn spawn_inner(thread_name: Option<String>) -> Arc<Self> {
        let runner = Arc::new_cyclic(|self_weak| Self {
            queue: Arc::new(EventQueue::new()),
            deposited: true,
            thread_name,
            // The loop counts as running from the moment of creation, so a
            // submission racing thread startup is already accepted.
            running: AtomicBool::new(true),
            inner: Mutex::new(RunnerInner::default()),
            self_weak: self_weak.clone(),
        });

        let queue = Arc::clone(&runner.queue);
        // The thread must hold only a weak reference; a strong one would keep
        // the runner alive forever and its drop-time shutdown would never run.
        let self_weak = Arc::downgrade(&runner);

        let mut builder = thread::Builder::new();
        if let Some(name) = &runner.thread_name {
            builder = builder.name(name.clone());
        }
        let handle = builder
            .spawn(move || Self::deposited_main(&queue, &self_weak))
            .expect("failed to spawn event runner thread");

        let mut inner = runner.inner.lock().expect(ERR_POISONED_LOCK);
        inner.loop_thread = Some(handle.thread().id());
        inner.join_handle = Some(handle);
        drop(inner);

        runner
    }

    fn deposited_main(queue: &Arc<EventQueue>, self_weak: &Weak<EventRunner>) {
        queue.prepare();
        Self::run_loop(queue, self_weak);

        if let Some(runner) = self_weak.upgrade() {
            runner.running.store(false, Ordering::Release);
        }
    }

    /// The dispatch loop. Runs until the queue finishes.
    fn run_loop(queue: &Arc<EventQueue>, self_weak: &Weak<EventRunner>) {
        let previous = CURRENT_RUNNER.with(|slot| slot.borrow_mut().replace(self_weak.clone()));
        let _restore = scopeguard::guard(previous, |previous| {
            CURRENT_RUNNER.with(|slot| *slot.borrow_mut() = previous);
        });

        while let Some(event) = queue.get_event() {
            match event.owner().upgrade() {
                Some(handler) => handler.distribute(event),
                None => {
                    log::debug!(
                        "discarding event `{}`: owning handler is gone",
                        event.name()
                    );
                    queue.remove_orphans();
                }
            }
        }
    }

    /// Runs the dispatch loop on the calling thread until
    /// [`stop`](Self::stop). Re-arms the queue on entry, so a stopped runner
    /// can be run again.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] if the loop is active (here or on another
    /// thread); [`Error::NoPermit`] on a deposited runner, whose loop is not
    /// externally controllable.
    pub fn run(&self) -> Result<()> {
        if self.deposited && !self.is_in_current_thread() {
            return Err(Error::NoPermit);
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        self.inner.lock().expect(ERR_POISONED_LOCK).loop_thread =
            Some(thread::current().id());

        let _running = scopeguard::guard((), |()| {
            self.running.store(false, Ordering::Release);
        });

        self.queue.prepare();
        Self::run_loop(&self.queue, &self.self_weak);
        Ok(())
    }

    /// Ends the dispatch loop by finishing the queue, waking it if blocked.
    /// Idempotent: stopping a stopped runner succeeds again.
    ///
    /// # Errors
    ///
    /// [`Error::NoPermit`] on a deposited runner from outside its own thread.
    pub fn stop(&self) -> Result<()> {
        if self.deposited && !self.is_in_current_thread() {
            return Err(Error::NoPermit);
        }

        self.queue.finish();
        Ok(())
    }

    /// The runner whose `run()` loop the calling thread is presently inside,
    /// or `None` when the thread is not running any loop.
    #[must_use]
    pub fn current() -> Option<Arc<EventRunner>> {
        CURRENT_RUNNER.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Whether the dispatch loop is presently executing (on any thread).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the calling thread is the one executing this runner's loop.
    #[must_use]
    pub fn is_in_current_thread(&self) -> bool {
        self.is_running()
            && self.inner.lock().expect(ERR_POISONED_LOCK).loop_thread
                == Some(thread::current().id())
    }

    /// The queue feeding this runner's loop.
    #[must_use]
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// The internal thread's name, for deposited runners that were given one.
    #[must_use]
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Writes the runner's state and its queue's contents into `dumper`.
    pub fn dump(&self, dumper: &mut dyn Dumper) {
        let tag = dumper.tag().to_string();
        dumper.dump(&format!(
            "{tag} runner `{}`: {}",
            self.thread_name.as_deref().unwrap_or("unnamed"),
            if self.is_running() { "running" } else { "stopped" }
        ));
        self.queue.dump(dumper);
    }
}

impl Drop for EventRunner {
    fn drop(&mut self) {
        if !self.deposited {
            return;
        }

        self.queue.finish();

        let handle = self
            .inner
            .lock()
            .expect(ERR_POISONED_LOCK)
            .join_handle
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Dropped from inside its own loop; the thread is already on
                // its way out and cannot join itself.
                return;
            }

            if handle.join().is_err() {
                log::warn!("event runner thread panicked during shutdown");
            }
        }
    }
}
