//! Module with the repeating timer source.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::source::{Prepare, Source};

/// A repeating timer source.
///
/// Becomes ready every time its interval elapses and then runs its handler.
/// The timer re-arms from the moment of dispatch, not from the previous
/// deadline, so a slow handler delays subsequent runs rather than bunching
/// them up. The handler returning `false` deregisters the timer.
///
/// Millisecond precision at best: the poll step's wait bound is rounded up
/// to whole milliseconds and shared with all other sources, so a deadline
/// can be overrun by more urgent work.
///
/// Usually registered through [`Registry::add_timeout`].
///
/// [`Registry::add_timeout`]: crate::Registry::add_timeout
pub struct Timer {
    interval: Duration,
    deadline: Mutex<Instant>,
    handler: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Timer {
    /// Create a new timer, first due after `interval`.
    pub fn new<F>(interval: Duration, handler: F) -> Timer
        where F: Fn() -> bool + Send + Sync + 'static,
    {
        Timer {
            interval,
            deadline: Mutex::new(Instant::now() + interval),
            handler: Box::new(handler),
        }
    }

    /// The timer's interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap()
    }
}

impl Source for Timer {
    fn prepare(&self, now: Instant) -> Prepare {
        let deadline = self.deadline();
        if deadline <= now {
            Prepare::Ready
        } else {
            // Time between the deadline and right now bounds the poll wait.
            Prepare::Wait(Some(deadline.duration_since(now)))
        }
    }

    fn check(&self, now: Instant) -> bool {
        self.deadline() <= now
    }

    fn dispatch(&self, now: Instant) -> bool {
        let keep_alive = (self.handler)();
        if keep_alive {
            *self.deadline.lock().unwrap() = now + self.interval;
        }
        keep_alive
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("interval", &self.interval)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::source::{Prepare, Source};
    use super::Timer;

    #[test]
    fn becomes_ready_after_interval() {
        let interval = Duration::from_millis(10);
        let timer = Timer::new(interval, || true);
        let now = Instant::now();

        match timer.prepare(now) {
            Prepare::Wait(Some(timeout)) => assert!(timeout <= interval),
            prepared => panic!("unexpected prepare verdict: {:?}", prepared),
        }
        assert!(!timer.check(now));

        let later = now + interval;
        assert_eq!(timer.prepare(later), Prepare::Ready);
        assert!(timer.check(later));
    }

    #[test]
    fn rearms_from_dispatch_time() {
        let interval = Duration::from_millis(10);
        let timer = Timer::new(interval, || true);
        let later = Instant::now() + interval;

        assert!(timer.dispatch(later));
        // Not ready again until a full interval after the dispatch.
        assert!(!timer.check(later));
        assert_eq!(timer.prepare(later), Prepare::Wait(Some(interval)));
        assert!(timer.check(later + interval));
    }
}
