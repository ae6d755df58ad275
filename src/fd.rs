//! Module with the file descriptor readiness source.

use std::fmt;
use std::time::Instant;

use crate::poll::{Ready, Watch};
use crate::source::Source;

/// A source dispatched on file descriptor readiness.
///
/// Pairs a [`Watch`] with a handler: once the poll step observes any of the
/// watch's interests (or an error or hang-up condition, which are always
/// delivered) on the descriptor, the source is ready and the handler runs
/// with the observed readiness. The handler returning `false` deregisters
/// the source.
///
/// The watch itself must be contributed to the registry's poll table
/// separately, and removed again when the source goes:
///
/// ```
/// use std::sync::Arc;
///
/// use kairos::{FdSource, Interests, Priority, Registry, Watch};
/// use kairos::unix::new_pipe;
///
/// # fn main() -> std::io::Result<()> {
/// let registry = Registry::new()?;
/// let (_sender, receiver) = new_pipe()?;
///
/// let watch = Watch::new(receiver.fd(), Interests::READABLE);
/// registry.add_poll(watch.clone(), Priority::DEFAULT);
/// let id = registry.register(Priority::DEFAULT, false,
///     Arc::new(FdSource::new(watch.clone(), |readiness| {
///         readiness.is_readable() // Keep going until the pipe closes.
///     })));
///
/// // ... drive the registry ...
///
/// let _ = registry.deregister(id);
/// let _ = registry.remove_poll(&watch);
/// # Ok(())
/// # }
/// ```
pub struct FdSource {
    watch: Watch,
    handler: Box<dyn Fn(Ready) -> bool + Send + Sync>,
}

impl FdSource {
    /// Create a new source watching `watch`'s descriptor.
    pub fn new<F>(watch: Watch, handler: F) -> FdSource
        where F: Fn(Ready) -> bool + Send + Sync + 'static,
    {
        FdSource { watch, handler: Box::new(handler) }
    }

    /// The watch this source is driven by.
    pub fn watch(&self) -> &Watch {
        &self.watch
    }

    fn observed(&self) -> Ready {
        let mut wanted = Ready::ERROR | Ready::HUP;
        if self.watch.interests().is_readable() {
            wanted |= Ready::READABLE;
        }
        if self.watch.interests().is_writable() {
            wanted |= Ready::WRITABLE;
        }
        self.watch.readiness() & wanted
    }
}

impl Source for FdSource {
    fn check(&self, _now: Instant) -> bool {
        !self.observed().is_empty()
    }

    fn dispatch(&self, _now: Instant) -> bool {
        (self.handler)(self.observed())
    }
}

impl fmt::Debug for FdSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FdSource")
            .field("watch", &self.watch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::poll::{Interests, Ready, Watch};
    use crate::source::Source;
    use super::FdSource;

    #[test]
    fn ready_only_for_wanted_events() {
        let watch = Watch::new(0, Interests::READABLE);
        let source = FdSource::new(watch.clone(), |_| true);
        let now = Instant::now();

        assert!(!source.check(now));

        // Writable readiness is not part of the interests.
        watch.set_readiness(Ready::WRITABLE);
        assert!(!source.check(now));

        watch.set_readiness(Ready::READABLE);
        assert!(source.check(now));

        // Hang-up is always delivered.
        watch.set_readiness(Ready::HUP);
        assert!(source.check(now));
    }
}
