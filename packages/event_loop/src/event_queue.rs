use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::ERR_POISONED_LOCK;
use crate::dump::Dumper;
use crate::error::{Error, Result};
use crate::event_handler::EventHandler;
use crate::fd_listener::{FdEvents, FileDescriptorListener};
use crate::inner_event::InnerEvent;
use crate::io_waiter::{CondvarIoWaiter, FdReadiness, IoWaiter};
use crate::priority::Priority;

/// How many consecutive dispatches a bucket may win while a less urgent
/// bucket also has ready work, before the pick moves down one bucket.
const DEFAULT_STARVATION_LIMIT: u32 = 5;

/// Number of realtime buckets (immediate, high, low).
const REALTIME_BUCKETS: usize = 3;

/// Labels for dump output, in bucket order.
const BUCKET_LABELS: [&str; REALTIME_BUCKETS] = ["immediate", "high", "low"];

/// One realtime bucket: events ordered by handle time (insertion order breaks
/// ties) plus the consecutive-dispatch counter for starvation avoidance.
#[derive(Debug, Default)]
struct SubQueue {
    events: VecDeque<Box<InnerEvent>>,
    consecutive: u32,
}

/// Registration record for one watched file descriptor.
struct FdListenerEntry {
    events: FdEvents,
    listener: Arc<dyn FileDescriptorListener>,
    owner: Weak<EventHandler>,
}

impl std::fmt::Debug for FdListenerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdListenerEntry")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Everything guarded by the queue lock.
#[derive(Debug)]
pub(crate) struct QueueState {
    /// `false` both before the first `prepare()` and after `finish()`:
    /// inserts are buffered but nothing is delivered.
    prepared: bool,

    realtime: [SubQueue; REALTIME_BUCKETS],
    idle: VecDeque<Box<InnerEvent>>,

    /// Set when the consumer last found no ready realtime work.
    is_idle: bool,

    fd_listeners: foldhash::HashMap<i32, FdListenerEntry>,
    waiter: Arc<dyn IoWaiter>,
    starvation_limit: u32,
}

/// Thread-confined holding structure for one runner's pending work.
///
/// Producers on any thread insert events; a single consumer (the runner's
/// thread) blocks in [`get_event`](Self::get_event) until work is ready. Four
/// priority levels share the queue: three realtime buckets picked with
/// bounded interleaving so lower-priority work cannot starve, plus an idle
/// bucket served only when nothing else is ready.
///
/// The queue starts unprepared: events inserted before the first
/// [`prepare`](Self::prepare) are buffered, not delivered, and after
/// [`finish`](Self::finish) delivery stops until `prepare` re-arms it.
///
/// Registering a [`FileDescriptorListener`] routes fd readiness through the
/// same wait primitive the consumer blocks on, surfacing it as synthetic
/// events owned by the listener's handler.
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
}

fn ordered_insert(queue: &mut VecDeque<Box<InnerEvent>>, event: Box<InnerEvent>) {
    let handle_time = event.handle_time();
    let index = queue
        .iter()
        .rposition(|queued| queued.handle_time() <= handle_time)
        .map_or(0, |found| found + 1);
    queue.insert(index, event);
}

fn merge_deadline(deadline: &mut Option<Instant>, candidate: Instant) {
    match deadline {
        Some(current) if *current <= candidate => {}
        _ => *deadline = Some(candidate),
    }
}

impl QueueState {
    fn insert_event(&mut self, event: Box<InnerEvent>, priority: Priority) {
        match priority.bucket_index() {
            Some(index) => ordered_insert(&mut self.realtime[index].events, event),
            None => ordered_insert(&mut self.idle, event),
        }
    }

    /// Picks the realtime event to dispatch now, if any. The most urgent
    /// bucket with a due event wins, unless it has already won
    /// `starvation_limit` consecutive picks while a less urgent bucket also
    /// had due work; then the pick moves down, and winning resets the
    /// counters of every more urgent bucket.
    fn pick_ready_realtime(
        &mut self,
        now: Instant,
        next_deadline: &mut Option<Instant>,
    ) -> Option<Box<InnerEvent>> {
        let mut winner: Option<usize> = None;

        for index in 0..REALTIME_BUCKETS {
            let Some(front) = self.realtime[index].events.front() else {
                continue;
            };

            if front.handle_time() > now {
                merge_deadline(next_deadline, front.handle_time());
                continue;
            }

            winner = match winner {
                Some(current) if self.realtime[current].consecutive < self.starvation_limit => {
                    Some(current)
                }
                _ => Some(index),
            };
        }

        let index = winner?;
        for bucket in self.realtime.iter_mut().take(index) {
            bucket.consecutive = 0;
        }
        self.realtime[index].consecutive += 1;
        self.realtime[index].events.pop_front()
    }

    /// One non-blocking pass: returns a due event (idle only when no realtime
    /// work is ready) and records the next wake-up deadline otherwise.
    fn poll_expired(
        &mut self,
        now: Instant,
        next_deadline: &mut Option<Instant>,
    ) -> Option<Box<InnerEvent>> {
        if let Some(event) = self.pick_ready_realtime(now, next_deadline) {
            self.is_idle = false;
            return Some(event);
        }

        // Nothing urgent is ready: the consumer is now idling, which is the
        // request for idle work.
        self.is_idle = true;

        if let Some(front) = self.idle.front() {
            if front.handle_time() <= now {
                return self.idle.pop_front();
            }

            merge_deadline(next_deadline, front.handle_time());
        }

        None
    }

    fn retain_events<F>(&mut self, mut keep: F)
    where
        F: FnMut(&InnerEvent) -> bool,
    {
        for bucket in &mut self.realtime {
            bucket.events.retain(|event| keep(event));
        }
        self.idle.retain(|event| keep(event));
    }

    fn any_event<F>(&self, mut matches: F) -> bool
    where
        F: FnMut(&InnerEvent) -> bool,
    {
        self.realtime
            .iter()
            .flat_map(|bucket| bucket.events.iter())
            .chain(self.idle.iter())
            .any(|event| matches(event))
    }

    /// Turns poller readiness into a synthetic task event that invokes the
    /// listener's callbacks on the owning runner's thread.
    fn enqueue_fd_readiness(&mut self, readiness: FdReadiness) {
        let Some(entry) = self.fd_listeners.get(&readiness.fd) else {
            // Unregistered while the poller was reporting it.
            self.waiter.unwatch(readiness.fd);
            return;
        };

        if entry.owner.strong_count() == 0 {
            log::warn!(
                "dropping readiness for fd {}: owning handler is gone",
                readiness.fd
            );
            self.fd_listeners.remove(&readiness.fd);
            self.waiter.unwatch(readiness.fd);
            return;
        }

        let mut fired = FdEvents::empty();
        for condition in [FdEvents::READABLE, FdEvents::WRITABLE, FdEvents::EXCEPTION] {
            if entry.events.contains(condition) && readiness.events.contains(condition) {
                fired |= condition;
            }
        }
        if fired.is_empty() {
            return;
        }

        let listener = Arc::clone(&entry.listener);
        let owner = entry.owner.clone();
        let fd = readiness.fd;

        let mut event = InnerEvent::with_task(
            move || {
                if fired.contains(FdEvents::READABLE) {
                    listener.on_readable(fd);
                }
                if fired.contains(FdEvents::WRITABLE) {
                    listener.on_writable(fd);
                }
                if fired.contains(FdEvents::EXCEPTION) {
                    listener.on_exception(fd);
                }
            },
            "fd-readiness",
        );
        event.set_owner(owner);
        self.insert_event(event, Priority::Immediate);
    }

    /// Replaces the condvar waiter with the platform poller.
    #[cfg(unix)]
    fn install_poller(&mut self) -> Result<()> {
        let poller: Arc<dyn IoWaiter> = Arc::new(crate::epoll_io_waiter::EpollIoWaiter::new()?);

        // Consumers parked on the retiring waiter must re-park on the
        // poller; they re-examine state under the lock and pick it up.
        self.waiter.wake();
        self.waiter = poller;
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_poller(&mut self) -> Result<()> {
        Err(Error::FdNotSupported {
            reason: "no poller is available on this platform".to_string(),
        })
    }
}

impl EventQueue {
    /// Creates a queue with the default starvation bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_starvation_limit(DEFAULT_STARVATION_LIMIT)
    }

    /// Creates a queue whose buckets yield to less urgent ready work after
    /// `limit` consecutive dispatches. Only boundedness matters for
    /// correctness; the value tunes latency of low-priority work under load.
    #[must_use]
    pub fn with_starvation_limit(limit: u32) -> Self {
        Self {
            state: Mutex::new(QueueState {
                prepared: false,
                realtime: [SubQueue::default(), SubQueue::default(), SubQueue::default()],
                idle: VecDeque::new(),
                is_idle: true,
                fd_listeners: foldhash::HashMap::default(),
                waiter: Arc::new(CondvarIoWaiter::default()),
                starvation_limit: limit,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    /// Inserts an event at the given priority, waking a blocked consumer.
    ///
    /// Priority decides urgency only; within a bucket, events fire in
    /// `handle_time` order with insertion order breaking ties. Inserting into
    /// an unprepared queue buffers the event until [`prepare`](Self::prepare).
    pub fn insert(&self, event: Box<InnerEvent>, priority: Priority) {
        let mut state = self.state();

        if !state.prepared {
            log::debug!(
                "queue is not prepared; buffering event `{}` until prepare",
                event.name()
            );
        }

        state.insert_event(event, priority);
        state.waiter.wake();
    }

    /// Blocks until an event is due, a registered file descriptor becomes
    /// ready (surfaced as a synthetic event), or [`finish`](Self::finish) is
    /// called (returns `None`).
    ///
    /// The wait is bounded by the nearest `handle_time` across all buckets
    /// and expires exactly then; there is no polling. Idle events are
    /// returned only when no realtime work is ready.
    pub fn get_event(&self) -> Option<Box<InnerEvent>> {
        let mut state = self.state();

        loop {
            if !state.prepared {
                return None;
            }

            let mut next_deadline = None;
            if let Some(event) = state.poll_expired(Instant::now(), &mut next_deadline) {
                return Some(event);
            }

            let waiter = Arc::clone(&state.waiter);
            let (mut relocked, readiness) = waiter.wait_until(&self.state, state, next_deadline);
            for item in readiness {
                relocked.enqueue_fd_readiness(item);
            }
            state = relocked;
        }
    }

    /// Non-blocking variant of [`get_event`](Self::get_event) for external
    /// loop integration: returns an already-due event if there is one, and
    /// writes the deadline at which the next event becomes due (or `None`
    /// when the queue holds nothing scheduled).
    pub fn get_expired_event(
        &self,
        next_expired_time: &mut Option<Instant>,
    ) -> Option<Box<InnerEvent>> {
        let mut state = self.state();
        *next_expired_time = None;

        if !state.prepared {
            return None;
        }

        state.poll_expired(Instant::now(), next_expired_time)
    }

    /// Removes every not-yet-delivered event owned by `owner`.
    pub fn remove_all_for(&self, owner: &Weak<EventHandler>) {
        self.state()
            .retain_events(|event| !Weak::ptr_eq(event.owner(), owner));
    }

    /// Removes `owner`'s id-bearing events with the given id.
    pub fn remove(&self, owner: &Weak<EventHandler>, id: u32) {
        self.state().retain_events(|event| {
            !(Weak::ptr_eq(event.owner(), owner) && !event.has_task() && event.id() == id)
        });
    }

    /// Removes `owner`'s id-bearing events matching both id and param.
    pub fn remove_with_param(&self, owner: &Weak<EventHandler>, id: u32, param: i64) {
        self.state().retain_events(|event| {
            !(Weak::ptr_eq(event.owner(), owner)
                && !event.has_task()
                && event.id() == id
                && event.param() == param)
        });
    }

    /// Removes `owner`'s task events whose name matches `name` exactly.
    pub fn remove_task(&self, owner: &Weak<EventHandler>, name: &str) {
        self.state().retain_events(|event| {
            !(Weak::ptr_eq(event.owner(), owner)
                && event.has_task()
                && event.task_name() == name)
        });
    }

    /// Purges every event and file descriptor listener whose owning handler
    /// no longer exists. Invoked on handler teardown and opportunistically by
    /// the dispatch loop; dispatch therefore never upgrades a dead owner.
    pub fn remove_orphans(&self) {
        let mut state = self.state();

        let mut purged = 0_usize;
        state.retain_events(|event| {
            let alive = event.owner().strong_count() > 0;
            if !alive {
                purged += 1;
            }
            alive
        });

        let orphaned_fds: Vec<i32> = state
            .fd_listeners
            .iter()
            .filter(|(_, entry)| entry.owner.strong_count() == 0)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in &orphaned_fds {
            state.fd_listeners.remove(fd);
            state.waiter.unwatch(*fd);
        }

        if purged > 0 || !orphaned_fds.is_empty() {
            log::debug!(
                "purged {purged} orphaned events and {} orphaned fd listeners",
                orphaned_fds.len()
            );
        }
    }

    /// Whether any not-yet-delivered id-bearing event has the given id.
    /// Diagnostic: scans all owners.
    #[must_use]
    pub fn has_event_with_id(&self, id: u32) -> bool {
        self.state()
            .any_event(|event| !event.has_task() && event.id() == id)
    }

    /// Whether any not-yet-delivered id-bearing event carries the given
    /// param. Diagnostic: scans all owners.
    #[must_use]
    pub fn has_event_with_param(&self, param: i64) -> bool {
        self.state()
            .any_event(|event| !event.has_task() && event.param() == param)
    }

    /// Registers a readiness listener for `fd`, owned by `owner`.
    ///
    /// Registration is exclusive per descriptor. The first registration on a
    /// queue installs the platform poller in place of the plain condvar
    /// waiter.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a negative descriptor or an empty/unknown interest
    /// mask; `FdAlreadyRegistered` if the descriptor already has a listener
    /// on this queue; `FdNotSupported` when no poller can be set up on this
    /// platform; `FdLimitExceeded` when the poller is out of capacity.
    pub fn add_file_descriptor_listener(
        &self,
        fd: i32,
        events: FdEvents,
        listener: Arc<dyn FileDescriptorListener>,
        owner: Weak<EventHandler>,
    ) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidParam {
                reason: format!("file descriptor {fd} is negative"),
            });
        }
        if events.is_empty() || !events.is_recognized() {
            return Err(Error::InvalidParam {
                reason: format!("interest mask {events:?} is empty or unrecognized"),
            });
        }

        let mut state = self.state();

        if state.fd_listeners.contains_key(&fd) {
            return Err(Error::FdAlreadyRegistered { fd });
        }

        if !state.waiter.supports_fd_listening() {
            state.install_poller()?;
        }

        state.waiter.watch(fd, events)?;
        state.fd_listeners.insert(
            fd,
            FdListenerEntry {
                events,
                listener,
                owner,
            },
        );
        state.waiter.wake();
        Ok(())
    }

    /// Unregisters the listener for `fd`, if any, waking the consumer.
    pub fn remove_file_descriptor_listener(&self, fd: i32) {
        let mut state = self.state();

        if state.fd_listeners.remove(&fd).is_some() {
            state.waiter.unwatch(fd);
            state.waiter.wake();
        }
    }

    /// Unregisters every listener owned by `owner`, waking the consumer.
    pub fn remove_file_descriptor_listeners_for(&self, owner: &Weak<EventHandler>) {
        let mut state = self.state();

        let fds: Vec<i32> = state
            .fd_listeners
            .iter()
            .filter(|(_, entry)| Weak::ptr_eq(&entry.owner, owner))
            .map(|(fd, _)| *fd)
            .collect();

        if fds.is_empty() {
            return;
        }

        for fd in &fds {
            state.fd_listeners.remove(fd);
            state.waiter.unwatch(*fd);
        }
        state.waiter.wake();
    }

    /// Arms (or re-arms) delivery, waking any blocked consumer.
    pub fn prepare(&self) {
        let mut state = self.state();
        state.prepared = true;
        state.waiter.wake();
    }

    /// Stops delivery, waking any blocked consumer:
    /// [`get_event`](Self::get_event) returns `None` until
    /// [`prepare`](Self::prepare) re-arms the queue. Buffered events are kept.
    pub fn finish(&self) {
        let mut state = self.state();
        state.prepared = false;
        state.waiter.wake();
    }

    /// Whether no event at all is buffered, at any priority.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.state();
        state.realtime.iter().all(|bucket| bucket.events.is_empty()) && state.idle.is_empty()
    }

    /// Whether the consumer last found no ready realtime work.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state().is_idle
    }

    /// Writes a snapshot of pending work into `dumper`.
    pub fn dump(&self, dumper: &mut dyn Dumper) {
        let state = self.state();
        let tag = dumper.tag().to_string();

        for (label, bucket) in BUCKET_LABELS.iter().zip(state.realtime.iter()) {
            dumper.dump(&format!(
                "{tag} {label} bucket: {} pending",
                bucket.events.len()
            ));
            for event in &bucket.events {
                dumper.dump(&format!("{tag}   `{}`", event.name()));
            }
        }

        dumper.dump(&format!("{tag} idle bucket: {} pending", state.idle.len()));
        for event in &state.idle {
            dumper.dump(&format!("{tag}   `{}`", event.name()));
        }

        dumper.dump(&format!(
            "{tag} fd listeners: {}",
            state.fd_listeners.len()
        ));
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use static_assertions::assert_impl_all;
    use testing::under_watchdog;

    use crate::dump::test_support::CapturingDumper;

    use super::*;

    assert_impl_all!(EventQueue: Send, Sync);

    /// An id-bearing event with both times pinned to `at`.
    fn event_at(id: u32, at: Instant) -> Box<InnerEvent> {
        let mut event = InnerEvent::new(id);
        event.set_send_time(at);
        event.set_handle_time(at);
        event
    }

    fn drain_ids(queue: &EventQueue, count: usize) -> Vec<u32> {
        (0..count)
            .map(|_| queue.get_event().expect("queue should have an event ready").id())
            .collect()
    }

    #[test]
    fn unprepared_queue_buffers_inserts() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();

            queue.insert(event_at(7, now), Priority::Low);
            assert!(queue.get_event().is_none());

            queue.prepare();
            assert_eq!(queue.get_event().unwrap().id(), 7);
        });
    }

    #[test]
    fn finish_stops_delivery_until_prepared_again() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();

            queue.prepare();
            queue.insert(event_at(0, now), Priority::Low);
            assert_eq!(queue.get_event().unwrap().id(), 0);

            queue.finish();
            queue.insert(event_at(1, now), Priority::Low);
            assert!(queue.get_event().is_none());

            queue.prepare();
            assert_eq!(queue.get_event().unwrap().id(), 1);
        });
    }

    #[test]
    fn equal_handle_time_dispatches_most_urgent_first() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();

            // Least urgent inserted first...
            for (id, priority) in [
                (0, Priority::Idle),
                (1, Priority::Low),
                (2, Priority::High),
                (3, Priority::Immediate),
            ] {
                queue.insert(event_at(id, now), priority);
            }
            assert_eq!(drain_ids(&queue, 4), [3, 2, 1, 0]);

            // ...and most urgent inserted first; insertion order must not
            // matter across buckets.
            for (id, priority) in [
                (0, Priority::Immediate),
                (1, Priority::High),
                (2, Priority::Low),
                (3, Priority::Idle),
            ] {
                queue.insert(event_at(id, now), priority);
            }
            assert_eq!(drain_ids(&queue, 4), [0, 1, 2, 3]);
        });
    }

    #[test]
    fn equal_priority_dispatches_in_insertion_order() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();

            for id in [4, 2, 9] {
                queue.insert(event_at(id, now), Priority::Low);
            }
            assert_eq!(drain_ids(&queue, 3), [4, 2, 9]);
        });
    }

    #[test]
    fn delayed_event_is_not_returned_before_it_is_due() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            queue.prepare();

            let delay = Duration::from_millis(80);
            let due = Instant::now() + delay;
            let mut event = InnerEvent::new(5);
            event.set_handle_time(due);
            queue.insert(event, Priority::Low);

            let event = queue.get_event().unwrap();
            let woke = Instant::now();
            assert_eq!(event.id(), 5);
            assert!(woke >= due, "event returned {:?} early", due - woke);
            assert!(
                woke <= due + Duration::from_millis(500),
                "event returned {:?} late",
                woke - due
            );
        });
    }

    #[test]
    fn sustained_high_priority_yields_to_low() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();

            for id in 0..2 {
                queue.insert(event_at(id, now), Priority::Low);
            }
            for id in 2..12 {
                queue.insert(event_at(id, now), Priority::High);
            }

            assert_eq!(
                drain_ids(&queue, 12),
                [2, 3, 4, 5, 6, 0, 7, 8, 9, 10, 11, 1]
            );
        });
    }

    #[test]
    fn starvation_avoidance_cascades_through_every_bucket() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();

            for id in 100..112 {
                queue.insert(event_at(id, now), Priority::Immediate);
            }
            for id in 200..203 {
                queue.insert(event_at(id, now), Priority::High);
            }
            queue.insert(event_at(300, now), Priority::Low);

            assert_eq!(
                drain_ids(&queue, 16),
                [
                    100, 101, 102, 103, 104, 200, 105, 106, 107, 108, 109, 201, 110, 111, 202,
                    300
                ]
            );
        });
    }

    #[test]
    fn custom_starvation_limit_is_honored() {
        under_watchdog(|| {
            let queue = EventQueue::with_starvation_limit(2);
            let now = Instant::now();
            queue.prepare();

            queue.insert(event_at(9, now), Priority::Low);
            for id in 0..4 {
                queue.insert(event_at(id, now), Priority::High);
            }

            assert_eq!(drain_ids(&queue, 5), [0, 1, 9, 2, 3]);
        });
    }

    #[test]
    fn remove_filters_by_owner_and_id() {
        under_watchdog(|| {
            let first = crate::EventHandler::detached();
            let second = crate::EventHandler::detached();
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();

            let mut event = event_at(5, now);
            event.set_owner(Arc::downgrade(&first));
            queue.insert(event, Priority::Low);

            let mut event = event_at(5, now);
            event.set_owner(Arc::downgrade(&second));
            queue.insert(event, Priority::Low);

            queue.remove(&Arc::downgrade(&first), 5);

            // Only the second owner's event survives.
            assert!(queue.has_event_with_id(5));
            let survivor = queue.get_event().unwrap();
            assert!(Weak::ptr_eq(survivor.owner(), &Arc::downgrade(&second)));
            assert!(queue.is_empty());
        });
    }

    #[test]
    fn remove_with_param_requires_both_to_match() {
        under_watchdog(|| {
            let owner = crate::EventHandler::detached();
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();

            for param in [10, 20] {
                let mut event = InnerEvent::with_param(3, param);
                event.set_send_time(now);
                event.set_handle_time(now);
                event.set_owner(Arc::downgrade(&owner));
                queue.insert(event, Priority::Low);
            }

            queue.remove_with_param(&Arc::downgrade(&owner), 3, 10);

            assert!(!queue.has_event_with_param(10));
            assert!(queue.has_event_with_param(20));
        });
    }

    #[test]
    fn remove_task_matches_exact_name_only() {
        under_watchdog(|| {
            let owner = crate::EventHandler::detached();
            let queue = EventQueue::new();
            queue.prepare();

            let ran = Arc::new(AtomicUsize::new(0));
            for name in ["refresh", "refresh-all"] {
                let ran = Arc::clone(&ran);
                let mut event = InnerEvent::with_task(
                    move || {
                        ran.fetch_add(1, AtomicOrdering::SeqCst);
                    },
                    name,
                );
                event.set_owner(Arc::downgrade(&owner));
                queue.insert(event, Priority::Low);
            }

            queue.remove_task(&Arc::downgrade(&owner), "refresh");

            let mut survivor = queue.get_event().unwrap();
            assert_eq!(survivor.task_name(), "refresh-all");
            survivor.take_task().unwrap()();
            assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
            assert!(queue.is_empty());
        });
    }

    #[test]
    fn orphaned_events_are_purged() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();

            let owner = crate::EventHandler::detached();
            for id in 0..3 {
                let mut event = event_at(id, now);
                event.set_owner(Arc::downgrade(&owner));
                queue.insert(event, Priority::Low);
            }
            drop(owner);

            queue.remove_orphans();
            assert!(queue.is_empty());
        });
    }

    #[test]
    fn diagnostic_scans_see_pending_events_only() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();

            let mut event = InnerEvent::with_param(8, 42);
            event.set_send_time(now);
            event.set_handle_time(now);
            queue.insert(event, Priority::Low);

            assert!(queue.has_event_with_id(8));
            assert!(queue.has_event_with_param(42));

            drop(queue.get_event().unwrap());

            assert!(!queue.has_event_with_id(8));
            assert!(!queue.has_event_with_param(42));
        });
    }

    #[test]
    fn fd_registration_validates_its_parameters() {
        struct Quiet;
        impl FileDescriptorListener for Quiet {}

        let owner = crate::EventHandler::detached();
        let queue = EventQueue::new();

        assert!(matches!(
            queue.add_file_descriptor_listener(
                -1,
                FdEvents::READABLE,
                Arc::new(Quiet),
                Arc::downgrade(&owner)
            ),
            Err(Error::InvalidParam { .. })
        ));
        assert!(matches!(
            queue.add_file_descriptor_listener(
                0,
                FdEvents::empty(),
                Arc::new(Quiet),
                Arc::downgrade(&owner)
            ),
            Err(Error::InvalidParam { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn fd_registration_is_exclusive_until_removed() {
        struct Quiet;
        impl FileDescriptorListener for Quiet {}

        let owner = crate::EventHandler::detached();
        let queue = EventQueue::new();

        let mut fds = [0_i32; 2];
        // SAFETY: Plain pipe creation into a correctly sized array.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let read_end = fds[0];

        queue
            .add_file_descriptor_listener(
                read_end,
                FdEvents::READABLE,
                Arc::new(Quiet),
                Arc::downgrade(&owner),
            )
            .unwrap();

        assert!(matches!(
            queue.add_file_descriptor_listener(
                read_end,
                FdEvents::READABLE,
                Arc::new(Quiet),
                Arc::downgrade(&owner)
            ),
            Err(Error::FdAlreadyRegistered { .. })
        ));

        queue.remove_file_descriptor_listener(read_end);
        queue
            .add_file_descriptor_listener(
                read_end,
                FdEvents::READABLE,
                Arc::new(Quiet),
                Arc::downgrade(&owner),
            )
            .unwrap();

        // SAFETY: Closing descriptors this test created.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn dump_reports_every_bucket() {
        let queue = EventQueue::new();
        let now = Instant::now();
        queue.prepare();
        queue.insert(event_at(1, now), Priority::High);

        let mut dumper = CapturingDumper::default();
        queue.dump(&mut dumper);

        assert!(dumper.lines.iter().any(|line| line.contains("high bucket: 1 pending")));
        assert!(dumper.lines.iter().any(|line| line.contains("idle bucket: 0 pending")));
    }

    #[test]
    fn idle_flag_follows_ready_work() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            let now = Instant::now();
            queue.prepare();
            assert!(queue.is_idle());

            queue.insert(event_at(1, now), Priority::Low);
            drop(queue.get_event().unwrap());
            assert!(!queue.is_idle());

            let mut next = None;
            assert!(queue.get_expired_event(&mut next).is_none());
            assert!(queue.is_idle());
        });
    }

    #[test]
    fn expired_pick_reports_the_next_deadline() {
        under_watchdog(|| {
            let queue = EventQueue::new();
            queue.prepare();

            let due = Instant::now() + Duration::from_secs(5);
            let mut event = InnerEvent::new(2);
            event.set_handle_time(due);
            queue.insert(event, Priority::Low);

            let mut next = None;
            assert!(queue.get_expired_event(&mut next).is_none());
            assert_eq!(next, Some(due));
        });
    }
}
