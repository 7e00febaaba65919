use std::sync::{Condvar, Mutex};

use crate::ERR_POISONED_LOCK;

/// State of a one-shot rendezvous.
#[derive(Debug)]
enum WaitState {
    /// Nothing has happened yet; waiters must block.
    Pending,

    /// The rendezvous fired; current and future waits return immediately.
    Notified,
}

/// A one-shot blocking rendezvous between a synchronous sender and the thread
/// that consumes its event.
///
/// One waiter is created per synchronous send and attached to the event. It is
/// notified when the event is destroyed, which happens either after dispatch
/// completes on the owning thread or when the event is removed from the queue
/// without ever being dispatched. Tying notification to destruction rather
/// than to dispatch is what makes removal safe: a blocked sender can never be
/// stranded by a `remove_*` call racing its event.
#[derive(Debug)]
pub(crate) struct Waiter {
    state: Mutex<WaitState>,
    condvar: Condvar,
}

impl Waiter {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Pending),
            condvar: Condvar::new(),
        }
    }

    /// Blocks the calling thread until [`notify`](Self::notify) has been
    /// called. Returns immediately if it already has.
    pub(crate) fn wait(&self) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        while matches!(*state, WaitState::Pending) {
            state = self.condvar.wait(state).expect(ERR_POISONED_LOCK);
        }
    }

    /// Fires the rendezvous, releasing every current and future waiter.
    /// Idempotent.
    pub(crate) fn notify(&self) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
        *state = WaitState::Notified;
        drop(state);

        self.condvar.notify_all();
    }
}
