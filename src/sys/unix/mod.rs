//! Unix implementation: `poll(2)` and a self-pipe waker.

use std::cmp::min;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::poll::{Interests, PollEntry, Ready};

pub(crate) mod pipe;

const MILLIS_PER_SEC: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

/// Wait for readiness on `entries` using `poll(2)`.
///
/// This is the default [multiplex call]. Blocks until at least one entry is
/// ready or `timeout` elapses (`None` blocks without bound), fills in the
/// observed readiness and returns the number of ready entries.
///
/// [multiplex call]: crate::PollFunc
pub fn poll(entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize> {
    let mut fds: Vec<libc::pollfd> = entries.iter()
        .map(|entry| libc::pollfd {
            fd: entry.fd,
            events: to_poll_events(entry.interests),
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.map(duration_to_millis).unwrap_or(-1);

    let n_events = unsafe {
        libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms)
    };
    match n_events {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(0), // Reached the time limit, nothing is ready.
        n => {
            for (entry, fd) in entries.iter_mut().zip(fds.iter()) {
                entry.readiness = from_poll_events(fd.revents);
            }
            Ok(n as usize)
        },
    }
}

/// Convert a `Duration` to milliseconds, rounding up.
fn duration_to_millis(duration: Duration) -> libc::c_int {
    let millis = duration.as_secs().saturating_mul(MILLIS_PER_SEC)
        .saturating_add((u64::from(duration.subsec_nanos()) + NANOS_PER_MILLI - 1) / NANOS_PER_MILLI);
    min(millis, libc::c_int::MAX as u64) as libc::c_int
}

fn to_poll_events(interests: Interests) -> libc::c_short {
    let mut events = libc::POLLPRI;
    if interests.is_readable() {
        events |= libc::POLLIN;
    }
    if interests.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

fn from_poll_events(revents: libc::c_short) -> Ready {
    let mut readiness = Ready::EMPTY;
    if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
        readiness |= Ready::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        readiness |= Ready::WRITABLE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        readiness |= Ready::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        readiness |= Ready::HUP;
    }
    readiness
}

/// Cross-thread wake-up pipe.
///
/// The read end is included in every poll snapshot; writing a single byte
/// from any thread makes a parked `poll(2)` call return. Both ends are
/// non-blocking, so waking an already woken pipe is a no-op rather than a
/// stall.
#[derive(Debug)]
pub(crate) struct Waker {
    reader: RawFd,
    writer: RawFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let mut fds: [RawFd; 2] = [-1, -1];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        let waker = Waker { reader: fds[0], writer: fds[1] };
        set_nonblocking_cloexec(waker.reader)?;
        set_nonblocking_cloexec(waker.writer)?;
        Ok(waker)
    }

    /// The readable end, to include in poll snapshots.
    pub(crate) fn fd(&self) -> RawFd {
        self.reader
    }

    /// Wake a parked poll call by writing a single byte.
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf = [1u8];
        let n = unsafe { libc::write(self.writer, buf.as_ptr() as *const libc::c_void, 1) };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                // The pipe is full, the wake-up is already pending.
                Ok(())
            } else {
                Err(err)
            }
        } else {
            Ok(())
        }
    }

    /// Consume pending wake-up bytes until the pipe is empty.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 128];
        loop {
            let n = unsafe {
                libc::read(self.reader, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                return;
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.reader);
            let _ = libc::close(self.writer);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::poll::{Interests, PollEntry, Ready};
    use super::{duration_to_millis, Waker};

    #[test]
    fn millis_round_up() {
        assert_eq!(duration_to_millis(Duration::from_millis(0)), 0);
        assert_eq!(duration_to_millis(Duration::from_millis(10)), 10);
        assert_eq!(duration_to_millis(Duration::from_nanos(1)), 1);
        assert_eq!(duration_to_millis(Duration::from_micros(1_500)), 2);
    }

    #[test]
    fn waker_wakes_poll() {
        let waker = Waker::new().unwrap();
        let mut entries = [PollEntry {
            fd: waker.fd(),
            interests: Interests::READABLE,
            readiness: Ready::EMPTY,
        }];

        // Nothing written yet, the poll times out.
        let n = super::poll(&mut entries, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);

        waker.wake().unwrap();
        let n = super::poll(&mut entries, Some(Duration::from_millis(500))).unwrap();
        assert_eq!(n, 1);
        assert!(entries[0].readiness.is_readable());

        // After draining the pipe is quiet again.
        waker.drain();
        entries[0].readiness = Ready::EMPTY;
        let n = super::poll(&mut entries, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
    }
}
