use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kairos::{MainLoop, Registry};

mod util;

use util::init;

#[test]
fn timer_fires_once_per_interval() {
    init();
    let registry = Registry::new().unwrap();
    let interval = Duration::from_millis(20);

    let start = Instant::now();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let id = registry.add_timeout(interval, move || {
        counter.fetch_add(1, Ordering::SeqCst) + 1 < 3
    });

    for _ in 0..3 {
        assert!(registry.iteration(true));
    }

    // Three intervals must have passed, and the third dispatch returning
    // false deregistered the timer.
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= interval * 3);
    assert!(!registry.contains(id));
}

#[test]
fn timer_is_not_ready_before_its_interval() {
    init();
    let registry = Registry::new().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let id = registry.add_timeout(Duration::from_millis(500), move || {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
        true
    });

    // A non-blocking iteration way before the deadline dispatches nothing.
    assert!(!registry.iteration(false));
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(registry.contains(id));
}

#[test]
fn shortest_timer_bounds_the_wait() {
    init();
    let registry = Registry::new().unwrap();

    let short_count = Arc::new(AtomicUsize::new(0));
    let long_count = Arc::new(AtomicUsize::new(0));

    let counter = short_count.clone();
    let _ = registry.add_timeout(Duration::from_millis(10), move || {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
        true
    });
    let counter = long_count.clone();
    let _ = registry.add_timeout(Duration::from_secs(60), move || {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
        true
    });

    // Blocks only until the short timer is due, not for the long one.
    let start = Instant::now();
    assert!(registry.iteration(true));
    assert!(start.elapsed() < Duration::from_secs(30));
    assert_eq!(short_count.load(Ordering::SeqCst), 1);
    assert_eq!(long_count.load(Ordering::SeqCst), 0);
}

#[test]
fn main_loop_quits_from_a_timer() {
    init();
    let registry = Arc::new(Registry::new().unwrap());
    let main_loop = MainLoop::new(registry.clone());

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let handle = main_loop.clone();
    let _ = registry.add_timeout(Duration::from_millis(5), move || {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            handle.quit();
            false
        } else {
            true
        }
    });

    assert!(!main_loop.is_running());
    main_loop.run();
    assert!(!main_loop.is_running());
    assert_eq!(count.load(Ordering::SeqCst), 3);
}
