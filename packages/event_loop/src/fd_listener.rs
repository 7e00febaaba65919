use std::ops::{BitOr, BitOrAssign};

/// Readiness conditions a file descriptor listener can subscribe to.
///
/// Masks combine with `|`:
///
/// ```rust
/// use event_loop::FdEvents;
///
/// let interest = FdEvents::READABLE | FdEvents::WRITABLE;
/// assert!(interest.contains(FdEvents::READABLE));
/// assert!(!interest.contains(FdEvents::EXCEPTION));
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FdEvents(u32);

impl FdEvents {
    /// The descriptor has data to read, or the peer hung up.
    pub const READABLE: Self = Self(1);

    /// The descriptor can accept a write without blocking.
    pub const WRITABLE: Self = Self(1 << 1);

    /// An error or exceptional condition is pending on the descriptor.
    pub const EXCEPTION: Self = Self(1 << 2);

    const KNOWN_BITS: u32 = 0b111;

    /// The mask selecting nothing.
    pub(crate) const fn empty() -> Self {
        Self(0)
    }

    /// Whether no condition at all is selected.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every condition in `other` is also selected in `self`.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the mask consists solely of recognized condition bits.
    pub(crate) fn is_recognized(self) -> bool {
        self.0 & !Self::KNOWN_BITS == 0
    }
}

impl BitOr for FdEvents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FdEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Receives readiness callbacks for a registered file descriptor.
///
/// Callbacks run on the owning runner's thread, delivered as ordinary queue
/// traffic: when the poller reports the descriptor ready, the queue inserts a
/// synthetic event that invokes the matching methods below. Override only the
/// conditions you subscribed to; the defaults do nothing.
pub trait FileDescriptorListener: Send + Sync {
    /// The descriptor became readable.
    fn on_readable(&self, fd: i32) {
        let _ = fd;
    }

    /// The descriptor became writable.
    fn on_writable(&self, fd: i32) {
        let _ = fd;
    }

    /// An error or exceptional condition was reported for the descriptor.
    fn on_exception(&self, fd: i32) {
        let _ = fd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_combine_and_contain() {
        let mut interest = FdEvents::READABLE;
        interest |= FdEvents::EXCEPTION;

        assert!(interest.contains(FdEvents::READABLE));
        assert!(interest.contains(FdEvents::EXCEPTION));
        assert!(!interest.contains(FdEvents::WRITABLE));
        assert!(!interest.is_empty());
        assert!(interest.is_recognized());
    }

    #[test]
    fn unknown_bits_are_not_recognized() {
        let bogus = FdEvents(1 << 7);
        assert!(!bogus.is_recognized());
    }
}
