//! Submits tasks and messages to a deposited runner, showing delays,
//! priorities, removal and a synchronous send.

use std::time::Duration;

use event_loop::{EventHandler, EventRunner, InnerEvent, Priority};

fn main() {
    env_logger::init();

    let runner = EventRunner::spawn_named("worker");
    let handler = EventHandler::with_processor(runner, |event| {
        println!("processed message id={} param={}", event.id(), event.param());
    });

    handler
        .post_task(
            || println!("immediate task ran"),
            Duration::ZERO,
            Priority::High,
        )
        .unwrap();

    handler
        .post_named_task(
            || println!("this never prints"),
            "doomed",
            Duration::from_millis(200),
            Priority::Low,
        )
        .unwrap();
    handler.remove_task("doomed");

    handler
        .post_task(
            || println!("delayed task ran"),
            Duration::from_millis(50),
            Priority::Low,
        )
        .unwrap();

    handler
        .send_event(
            InnerEvent::with_param(7, 99),
            Duration::ZERO,
            Priority::Low,
        )
        .unwrap();

    // Blocks until the worker thread has processed this specific event.
    handler
        .send_sync_event(InnerEvent::new(8), Priority::High)
        .unwrap();
    println!("synchronous send completed");

    std::thread::sleep(Duration::from_millis(300));
}
