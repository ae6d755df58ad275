//! Collection of testing utilities.

// Not all functions are used in all tests, causing warnings of unused
// functions while other tests are actually using them.
#![allow(dead_code)]

use std::sync::Once;
use std::time::Instant;

use kairos::{Prepare, Source};

/// Initialise the test setup, things like logging etc.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| std_logger::init());
}

/// A source built from a single dispatch closure, ready on every iteration.
pub struct AlwaysReady<F>(pub F);

impl<F> Source for AlwaysReady<F>
    where F: Fn(Instant) -> bool + Send + Sync,
{
    fn prepare(&self, _now: Instant) -> Prepare {
        Prepare::Ready
    }

    fn dispatch(&self, now: Instant) -> bool {
        (self.0)(now)
    }
}
