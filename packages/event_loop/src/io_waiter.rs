use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::ERR_POISONED_LOCK;
use crate::error::{Error, Result};
use crate::event_queue::QueueState;
use crate::fd_listener::FdEvents;

/// Readiness reported for one watched file descriptor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FdReadiness {
    pub(crate) fd: i32,
    pub(crate) events: FdEvents,
}

/// The queue's wait/wake seam.
///
/// The consumer parks here while the queue has nothing ready, releasing the
/// queue lock for the duration; every producer-side mutation wakes it through
/// the same object. The default implementation is a plain condition variable;
/// registering a file descriptor listener swaps in a poller-backed one so fd
/// readiness and queue wakeups share a single wait primitive.
///
/// Wakeups cannot be lost: producers call [`wake`](Self::wake) while holding
/// the queue lock, and the consumer re-examines queue state under that same
/// lock after every wait.
pub(crate) trait IoWaiter: Send + Sync + std::fmt::Debug {
    /// Parks the consumer until `deadline` (forever if `None`), a wakeup, or
    /// fd readiness. `guard` is released while parked and reacquired from
    /// `lock` before returning. Spurious returns are fine; the caller loops.
    fn wait_until<'a>(
        &self,
        lock: &'a Mutex<QueueState>,
        guard: MutexGuard<'a, QueueState>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, QueueState>, Vec<FdReadiness>);

    /// Wakes a parked consumer. Callable from any thread; must be called
    /// while holding the queue lock to guarantee the wakeup is observed.
    fn wake(&self);

    /// Whether [`watch`](Self::watch) can succeed on this implementation.
    fn supports_fd_listening(&self) -> bool;

    /// Starts reporting readiness for `fd` according to `events`.
    fn watch(&self, fd: i32, events: FdEvents) -> Result<()>;

    /// Stops reporting readiness for `fd`.
    fn unwatch(&self, fd: i32);
}

/// Condition-variable waiter; the default until fd listening is requested.
#[derive(Debug, Default)]
pub(crate) struct CondvarIoWaiter {
    condvar: Condvar,
}

impl IoWaiter for CondvarIoWaiter {
    fn wait_until<'a>(
        &self,
        _lock: &'a Mutex<QueueState>,
        guard: MutexGuard<'a, QueueState>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, QueueState>, Vec<FdReadiness>) {
        let guard = match deadline {
            None => self.condvar.wait(guard).expect(ERR_POISONED_LOCK),
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                if timeout.is_zero() {
                    return (guard, Vec::new());
                }

                self.condvar
                    .wait_timeout(guard, timeout)
                    .expect(ERR_POISONED_LOCK)
                    .0
            }
        };

        (guard, Vec::new())
    }

    fn wake(&self) {
        self.condvar.notify_all();
    }

    fn supports_fd_listening(&self) -> bool {
        false
    }

    fn watch(&self, _fd: i32, _events: FdEvents) -> Result<()> {
        Err(Error::FdNotSupported {
            reason: "this queue has no poller attached".to_string(),
        })
    }

    fn unwatch(&self, _fd: i32) {}
}
