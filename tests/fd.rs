use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kairos::unix::new_pipe;
use kairos::{FdSource, Interests, Priority, Ready, Registry, Watch};

mod util;

use util::{init, AlwaysReady};

#[test]
fn readable_pipe_dispatches_source() {
    init();
    let registry = Arc::new(Registry::new().unwrap());
    let (mut sender, receiver) = new_pipe().unwrap();

    let watch = Watch::new(receiver.fd(), Interests::READABLE);
    registry.add_poll(watch.clone(), Priority::DEFAULT);

    let seen = Arc::new(Mutex::new(Ready::EMPTY));
    let observed = seen.clone();
    let id = registry.register(Priority::DEFAULT, false,
        Arc::new(FdSource::new(watch.clone(), move |readiness| {
            *observed.lock().unwrap() = readiness;
            false
        })));

    // Nothing written yet, so nothing to dispatch.
    assert!(!registry.iteration(false));

    // Write while the iteration below is parked in the poll step.
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sender.write(b"!").unwrap(), 1);
        sender
    });

    assert!(registry.iteration(true));
    assert!(seen.lock().unwrap().is_readable());
    assert!(!registry.contains(id));

    let _sender = writer.join().unwrap();
    assert!(registry.remove_poll(&watch));
    assert!(!registry.remove_poll(&watch));
}

#[test]
fn less_urgent_watch_waits_for_urgent_work() {
    init();
    let registry = Registry::new().unwrap();
    let (mut sender, receiver) = new_pipe().unwrap();
    assert_eq!(sender.write(b"!").unwrap(), 1);

    let watch = Watch::new(receiver.fd(), Interests::READABLE);
    registry.add_poll(watch.clone(), Priority::LOW);

    let fd_count = Arc::new(AtomicUsize::new(0));
    let counter = fd_count.clone();
    let _ = registry.register(Priority::LOW, false,
        Arc::new(FdSource::new(watch.clone(), move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            false
        })));

    let busy_count = Arc::new(AtomicUsize::new(0));
    let counter = busy_count.clone();
    let busy = registry.register(Priority::HIGH, false, Arc::new(AlwaysReady(move |_| {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
        true
    })));

    // The pipe is readable, but the urgent source keeps the iteration's
    // attention: the watch is not even polled.
    assert!(registry.iteration(true));
    assert_eq!(busy_count.load(Ordering::SeqCst), 1);
    assert_eq!(fd_count.load(Ordering::SeqCst), 0);

    // Once the urgent source is gone the watch gets its turn.
    assert!(registry.deregister(busy));
    assert!(registry.iteration(true));
    assert_eq!(fd_count.load(Ordering::SeqCst), 1);

    assert!(registry.remove_poll(&watch));
}
