//! Watches a pipe through the event loop: readiness callbacks arrive on the
//! runner's thread as ordinary queue traffic.

#[cfg(unix)]
fn main() {
    use std::sync::Arc;
    use std::time::Duration;

    use event_loop::{EventHandler, EventRunner, FdEvents, FileDescriptorListener};

    env_logger::init();

    struct PrintingListener;

    impl FileDescriptorListener for PrintingListener {
        fn on_readable(&self, fd: i32) {
            let mut buffer = [0_u8; 16];
            // SAFETY: Reading into a live buffer of the stated size.
            let count = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
            println!("fd {fd} readable, drained {count} bytes");
        }
    }

    let mut fds = [0_i32; 2];
    // SAFETY: Plain pipe creation into a correctly sized array.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe creation failed");
    let (read_end, write_end) = (fds[0], fds[1]);

    let runner = EventRunner::spawn_named("pipe-watcher");
    let handler = EventHandler::new(runner);

    handler
        .add_file_descriptor_listener(read_end, FdEvents::READABLE, Arc::new(PrintingListener))
        .unwrap();

    for byte in 0..3_u8 {
        // SAFETY: Writing one byte from a live buffer.
        let rc = unsafe { libc::write(write_end, (&raw const byte).cast(), 1) };
        assert_eq!(rc, 1, "pipe write failed");
        std::thread::sleep(Duration::from_millis(100));
    }

    handler.remove_file_descriptor_listener(read_end);

    // SAFETY: Closing descriptors this example created.
    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
}

#[cfg(not(unix))]
fn main() {
    println!("fd readiness listening requires a unix platform");
}
