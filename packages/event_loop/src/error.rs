use thiserror::Error;

/// Errors reported by the event loop subsystem.
///
/// Every error is returned as a value from the call that detected it; none of
/// them is used as control flow inside the crate. Internal invariant
/// violations (a poisoned queue lock, corrupted bucket state) are not
/// represented here because they are fatal, not recoverable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller passed an argument the operation cannot act on, such as a
    /// negative file descriptor, an empty interest mask or an idle-priority
    /// synchronous send.
    #[error("invalid parameter: {reason}")]
    InvalidParam {
        /// A human-readable description of what was wrong.
        reason: String,
    },

    /// The handler is not bound to an event runner, or the runner it is bound
    /// to is not in a state that can serve the request.
    #[error("no usable event runner is bound")]
    NoEventRunner,

    /// The operation is reserved for the runner's own thread. Deposited
    /// runners own their loop lifecycle; outside callers may only submit.
    #[error("operation not permitted from this thread")]
    NoPermit,

    /// The runner's loop is already executing, possibly on another thread.
    #[error("event runner is already running")]
    AlreadyRunning,

    /// The file descriptor already has a listener registered on this queue.
    /// Registration is exclusive per descriptor.
    #[error("file descriptor {fd} already has a listener")]
    FdAlreadyRegistered {
        /// The descriptor that was being registered.
        fd: i32,
    },

    /// The poller ran out of capacity while registering the descriptor.
    #[error("poller capacity exhausted while registering file descriptor {fd}")]
    FdLimitExceeded {
        /// The descriptor that was being registered.
        fd: i32,
    },

    /// File descriptor listening is unavailable, either because the platform
    /// has no poller or because the poller could not be set up.
    #[error("file descriptor listening is not supported: {reason}")]
    FdNotSupported {
        /// A human-readable description of why.
        reason: String,
    },
}

/// A specialized `Result` type for event loop operations, returning the
/// crate's [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn errors_render_their_detail() {
        let error = Error::FdAlreadyRegistered { fd: 7 };
        assert!(error.to_string().contains('7'));

        let error = Error::InvalidParam {
            reason: "negative file descriptor".to_string(),
        };
        assert!(error.to_string().contains("negative file descriptor"));
    }
}
