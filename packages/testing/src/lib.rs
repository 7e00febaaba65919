//! Private helpers for tests and examples in Weft packages.
//!
//! Not published; not part of any public API surface.

use std::process;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// How long a guarded test may run before the whole process is taken down.
const WATCHDOG_DEADLINE: Duration = Duration::from_secs(10);

/// Runs a test body under a deadline, so a lost wakeup or a deadlocked wait
/// kills the test run instead of hanging the build forever.
///
/// The body executes on a helper thread. If it has not produced a result
/// within [`WATCHDOG_DEADLINE`], a diagnostic is printed and the process is
/// aborted; there is no way to unwind a thread that is stuck inside a
/// blocking primitive, so aborting is the honest outcome.
///
/// # Panics
///
/// Re-raises any panic from the test body on the calling thread.
///
/// # Example
///
/// ```rust
/// use testing::under_watchdog;
///
/// let sum = under_watchdog(|| 2 + 2);
/// assert_eq!(sum, 4);
/// ```
pub fn under_watchdog<F, R>(body: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (result_tx, result_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        // A send failure means the watchdog already gave up on us.
        drop(result_tx.send(body()));
    });

    match result_rx.recv_timeout(WATCHDOG_DEADLINE) {
        Ok(result) => {
            worker.join().expect("test body panicked after reporting a result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            eprintln!(
                "watchdog: test body still running after {WATCHDOG_DEADLINE:?}; aborting process"
            );
            process::abort();
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match worker.join() {
            Ok(()) => unreachable!("test body exited without reporting a result"),
            Err(panic) => std::panic::resume_unwind(panic),
        },
    }
}
