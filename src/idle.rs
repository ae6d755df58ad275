//! Module with the idle source.

use std::fmt;
use std::time::Instant;

use crate::source::{Prepare, Source};

/// An always-ready source for background work.
///
/// Registered at [`Priority::DEFAULT_IDLE`] (the convention, not a
/// requirement) it runs whenever an iteration finds nothing more urgent,
/// and keeps running once per iteration until its handler returns `false`.
/// An idle source at a lower (more urgent) priority than everything else
/// starves the rest of the registry by design.
///
/// Usually registered through [`Registry::add_idle`].
///
/// [`Priority::DEFAULT_IDLE`]: crate::Priority::DEFAULT_IDLE
/// [`Registry::add_idle`]: crate::Registry::add_idle
pub struct Idle {
    handler: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Idle {
    /// Create a new idle source.
    pub fn new<F>(handler: F) -> Idle
        where F: Fn() -> bool + Send + Sync + 'static,
    {
        Idle { handler: Box::new(handler) }
    }
}

impl Source for Idle {
    fn prepare(&self, _now: Instant) -> Prepare {
        Prepare::Ready
    }

    fn check(&self, _now: Instant) -> bool {
        true
    }

    fn dispatch(&self, _now: Instant) -> bool {
        (self.handler)()
    }
}

impl fmt::Debug for Idle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Idle").finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::source::{Prepare, Source};
    use super::Idle;

    #[test]
    fn always_ready() {
        let idle = Idle::new(|| false);
        let now = Instant::now();
        assert_eq!(idle.prepare(now), Prepare::Ready);
        assert!(idle.check(now));
        assert!(!idle.dispatch(now));
    }
}
