//! Poll descriptors and the pluggable multiplex call.
//!
//! A source that needs readiness notification on a file descriptor creates
//! a [`Watch`] — a shared record of the descriptor, the [`Interests`] it
//! wants monitored and the [`Ready`] events last observed — and contributes
//! it to the [registry] with [`add_poll`]. During the poll step the
//! registry snapshots all eligible watches into flat [`PollEntry`] records
//! and hands them to the registry's [`PollFunc`], the pluggable
//! "(descriptor array, timeout) → ready count" primitive. Observed events
//! are copied back onto the watches still present, where the owning
//! source's [`check`] reads them.
//!
//! [registry]: crate::Registry
//! [`add_poll`]: crate::Registry::add_poll
//! [`check`]: crate::Source::check

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Readiness events a [`Watch`] wants monitored.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Interests(u8);

impl Interests {
    /// Readable interest.
    pub const READABLE: Interests = Interests(1 << 0);
    /// Writable interest.
    pub const WRITABLE: Interests = Interests(1 << 1);
    /// Both readable and writable interest.
    pub const BOTH: Interests = Interests(Interests::READABLE.0 | Interests::WRITABLE.0);

    /// Whether readable interest is included.
    pub fn is_readable(self) -> bool {
        self.0 & Interests::READABLE.0 != 0
    }

    /// Whether writable interest is included.
    pub fn is_writable(self) -> bool {
        self.0 & Interests::WRITABLE.0 != 0
    }
}

impl BitOr for Interests {
    type Output = Interests;
    fn bitor(self, rhs: Interests) -> Interests {
        Interests(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interests {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("BOTH"),
            (true, false) => f.write_str("READABLE"),
            (false, true) => f.write_str("WRITABLE"),
            (false, false) => f.write_str("(empty)"),
        }
    }
}

/// Readiness events observed on a [`Watch`].
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Ready(u8);

impl Ready {
    /// No readiness.
    pub const EMPTY: Ready = Ready(0);
    /// Readable readiness.
    pub const READABLE: Ready = Ready(1 << 0);
    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(1 << 1);
    /// Error readiness.
    pub const ERROR: Ready = Ready(1 << 2);
    /// Hang-up readiness.
    pub const HUP: Ready = Ready(1 << 3);

    /// Whether no events are included.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether readable readiness is included.
    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    /// Whether writable readiness is included.
    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    /// Whether error readiness is included.
    pub fn is_error(self) -> bool {
        self.contains(Ready::ERROR)
    }

    /// Whether hang-up readiness is included.
    pub fn is_hup(self) -> bool {
        self.contains(Ready::HUP)
    }

    /// Whether all events in `other` are included in `self`.
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    fn from_bits(bits: u8) -> Ready {
        Ready(bits)
    }

    fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;
    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        let mut first = true;
        for &(event, name) in &[
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::ERROR, "ERROR"),
            (Ready::HUP, "HUP"),
        ] {
            if self.contains(event) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct WatchShared {
    fd: RawFd,
    interests: Interests,
    readiness: AtomicU8,
}

/// A poll descriptor record: a file descriptor, the interests to monitor
/// it with and the readiness last observed on it.
///
/// A `Watch` is shared: cloning yields a second handle to the same record,
/// and the registry identifies watches by record, not by descriptor, so
/// [`remove_poll`] removes exactly the record that was added. The
/// contributing source keeps a handle to read the [observed readiness] from
/// its [`check`] callback.
///
/// [`remove_poll`]: crate::Registry::remove_poll
/// [observed readiness]: Watch::readiness
/// [`check`]: crate::Source::check
#[derive(Clone, Debug)]
pub struct Watch {
    shared: Arc<WatchShared>,
}

impl Watch {
    /// Create a new watch for `fd` with the given interests.
    ///
    /// The watch starts with no observed readiness. The caller keeps
    /// ownership of the file descriptor; it must stay open for as long as
    /// the watch is part of a registry's poll table.
    pub fn new(fd: RawFd, interests: Interests) -> Watch {
        Watch {
            shared: Arc::new(WatchShared {
                fd,
                interests,
                readiness: AtomicU8::new(0),
            }),
        }
    }

    /// The watched file descriptor.
    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    /// The interests the descriptor is monitored with.
    pub fn interests(&self) -> Interests {
        self.shared.interests
    }

    /// The readiness observed by the most recent poll step that included
    /// this watch.
    pub fn readiness(&self) -> Ready {
        Ready::from_bits(self.shared.readiness.load(Ordering::SeqCst))
    }

    /// Whether `self` and `other` are handles to the same record.
    pub fn same(&self, other: &Watch) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn set_readiness(&self, readiness: Ready) {
        self.shared.readiness.store(readiness.bits(), Ordering::SeqCst);
    }
}

/// A flat poll descriptor, as handed to the [`PollFunc`].
///
/// The multiplex call reads `fd` and `interests` and fills in `readiness`
/// for every descriptor it found ready.
#[derive(Copy, Clone, Debug)]
pub struct PollEntry {
    /// The descriptor to wait on.
    pub fd: RawFd,
    /// The events to wait for.
    pub interests: Interests,
    /// The events observed, [`Ready::EMPTY`] on input.
    pub readiness: Ready,
}

/// The pluggable multiplex call used by the poll step.
///
/// Blocks until at least one of `entries` is ready or the timeout elapses
/// (`None` meaning no bound), fills in each ready entry's readiness and
/// returns how many were ready. Returning early with `0`, e.g. on
/// interruption, is fine; the registry simply starts its next iteration.
/// The default is [`sys::poll`], swap it with
/// [`Registry::set_poll_func`].
///
/// [`sys::poll`]: crate::sys::poll
/// [`Registry::set_poll_func`]: crate::Registry::set_poll_func
pub type PollFunc = fn(&mut [PollEntry], Option<Duration>) -> io::Result<usize>;

#[cfg(test)]
mod tests {
    use super::{Interests, Ready, Watch};

    #[test]
    fn interests() {
        assert!(Interests::READABLE.is_readable());
        assert!(!Interests::READABLE.is_writable());
        assert!(Interests::BOTH.is_readable());
        assert!(Interests::BOTH.is_writable());
        assert_eq!(Interests::READABLE | Interests::WRITABLE, Interests::BOTH);
    }

    #[test]
    fn ready_bits() {
        let ready = Ready::READABLE | Ready::HUP;
        assert!(ready.is_readable());
        assert!(ready.is_hup());
        assert!(!ready.is_writable());
        assert!(ready.contains(Ready::READABLE));
        assert!(!ready.contains(Ready::READABLE | Ready::ERROR));
        assert!(Ready::EMPTY.is_empty());
    }

    #[test]
    fn watch_handles_share_readiness() {
        let watch = Watch::new(0, Interests::READABLE);
        let handle = watch.clone();
        assert!(watch.same(&handle));
        assert_eq!(handle.readiness(), Ready::EMPTY);

        watch.set_readiness(Ready::READABLE);
        assert_eq!(handle.readiness(), Ready::READABLE);

        let other = Watch::new(0, Interests::READABLE);
        assert!(!watch.same(&other));
    }
}
