use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::ERR_POISONED_LOCK;
use crate::error::{Error, Result};
use crate::event_queue::QueueState;
use crate::fd_listener::FdEvents;
use crate::io_waiter::{FdReadiness, IoWaiter};

/// Upper bound on readiness records drained per wait.
const MAX_EVENTS_PER_WAIT: usize = 64;

/// Poller-backed waiter: an epoll instance watching the registered
/// descriptors plus an eventfd that producers write to wake the consumer.
///
/// Installed in place of the condvar waiter when the first file descriptor
/// listener registers; from then on queue wakeups and fd readiness share one
/// `epoll_wait`.
#[derive(Debug)]
pub(crate) struct EpollIoWaiter {
    epoll_fd: i32,
    wake_fd: i32,
}

impl EpollIoWaiter {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: Plain FFI calls creating new descriptors; no pointers involved.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::FdNotSupported {
                reason: format!("epoll_create1 failed: {}", io::Error::last_os_error()),
            });
        }

        // SAFETY: As above.
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let reason = format!("eventfd failed: {}", io::Error::last_os_error());
            // SAFETY: epoll_fd was just created and is owned solely by us.
            unsafe { libc::close(epoll_fd) };
            return Err(Error::FdNotSupported { reason });
        }

        let waiter = Self { epoll_fd, wake_fd };
        waiter.control(libc::EPOLL_CTL_ADD, wake_fd, libc::EPOLLIN as u32)?;
        Ok(waiter)
    }

    fn control(&self, op: libc::c_int, fd: i32, events: u32) -> Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        // SAFETY: `event` outlives the call; the kernel copies it.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &raw mut event) };
        if rc == 0 {
            return Ok(());
        }

        let errno = io::Error::last_os_error();
        Err(match errno.raw_os_error() {
            Some(libc::EEXIST) => Error::FdAlreadyRegistered { fd },
            Some(libc::ENOMEM | libc::ENOSPC | libc::EMFILE) => Error::FdLimitExceeded { fd },
            _ => Error::FdNotSupported {
                reason: format!("epoll_ctl failed for fd {fd}: {errno}"),
            },
        })
    }

    fn drain_wake_fd(&self) {
        let mut counter = 0_u64;

        // SAFETY: Reading 8 bytes into a u64, exactly what eventfd produces.
        let rc = unsafe {
            libc::read(
                self.wake_fd,
                (&raw mut counter).cast(),
                size_of::<u64>(),
            )
        };
        if rc < 0 {
            let errno = io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::EAGAIN) {
                log::warn!("draining event loop wake descriptor failed: {errno}");
            }
        }
    }

    fn readiness_from(raw: u32) -> FdEvents {
        let mut events = FdEvents::empty();

        if raw & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32) != 0 {
            events |= FdEvents::READABLE;
        }
        if raw & libc::EPOLLOUT as u32 != 0 {
            events |= FdEvents::WRITABLE;
        }
        if raw & (libc::EPOLLERR as u32 | libc::EPOLLPRI as u32 | libc::EPOLLHUP as u32) != 0 {
            events |= FdEvents::EXCEPTION;
        }

        events
    }

    fn interest_mask(events: FdEvents) -> u32 {
        let mut mask = 0_u32;

        if events.contains(FdEvents::READABLE) {
            mask |= libc::EPOLLIN as u32;
        }
        if events.contains(FdEvents::WRITABLE) {
            mask |= libc::EPOLLOUT as u32;
        }
        if events.contains(FdEvents::EXCEPTION) {
            mask |= libc::EPOLLPRI as u32;
        }

        mask
    }
}

impl IoWaiter for EpollIoWaiter {
    fn wait_until<'a>(
        &self,
        lock: &'a Mutex<QueueState>,
        guard: MutexGuard<'a, QueueState>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, QueueState>, Vec<FdReadiness>) {
        drop(guard);

        let timeout_ms: libc::c_int = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Round up so we never wake a hair early and spin.
                let millis = remaining
                    .as_millis()
                    .saturating_add(u128::from(remaining.subsec_nanos() % 1_000_000 != 0));
                millis.try_into().unwrap_or(libc::c_int::MAX)
            }
        };

        let mut raw_events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS_PER_WAIT];

        // SAFETY: The buffer is valid for MAX_EVENTS_PER_WAIT entries and the
        // kernel writes at most that many.
        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                raw_events.as_mut_ptr(),
                MAX_EVENTS_PER_WAIT as libc::c_int,
                timeout_ms,
            )
        };

        let mut readiness = Vec::new();
        if count < 0 {
            let errno = io::Error::last_os_error();
            // Signal interruption is an ordinary spurious wakeup.
            if errno.raw_os_error() != Some(libc::EINTR) {
                log::warn!("epoll_wait failed: {errno}");
            }
        } else {
            for raw in raw_events.iter().take(count as usize) {
                let fd = raw.u64 as i32;
                if fd == self.wake_fd {
                    self.drain_wake_fd();
                    continue;
                }

                readiness.push(FdReadiness {
                    fd,
                    events: Self::readiness_from(raw.events),
                });
            }
        }

        (lock.lock().expect(ERR_POISONED_LOCK), readiness)
    }

    fn wake(&self) {
        let increment = 1_u64;

        // SAFETY: Writing 8 bytes from a u64, exactly what eventfd expects.
        let rc = unsafe {
            libc::write(
                self.wake_fd,
                (&raw const increment).cast(),
                size_of::<u64>(),
            )
        };
        if rc < 0 {
            let errno = io::Error::last_os_error();
            // EAGAIN means the counter is already saturated; the consumer is
            // guaranteed to wake anyway.
            if errno.raw_os_error() != Some(libc::EAGAIN) {
                log::warn!("waking event loop consumer failed: {errno}");
            }
        }
    }

    fn supports_fd_listening(&self) -> bool {
        true
    }

    fn watch(&self, fd: i32, events: FdEvents) -> Result<()> {
        self.control(libc::EPOLL_CTL_ADD, fd, Self::interest_mask(events))
    }

    fn unwatch(&self, fd: i32) {
        // SAFETY: Removal takes no event argument on modern kernels.
        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            log::debug!(
                "unwatching fd {fd} failed (already closed?): {}",
                io::Error::last_os_error()
            );
        }
    }
}

impl Drop for EpollIoWaiter {
    fn drop(&mut self) {
        // SAFETY: Both descriptors are owned by this waiter and closed once.
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
