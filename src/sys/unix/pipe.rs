//! Unix pipe, usable as an inter-thread readiness channel.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use super::set_nonblocking_cloexec;

/// Create a new non-blocking Unix pipe.
///
/// A wrapper around the `pipe(2)` system call. Both ends are non-blocking
/// and close-on-exec; wait for readiness by creating a [`Watch`] for the
/// [`Receiver`]'s descriptor and contributing it to a registry.
///
/// [`Watch`]: crate::Watch
pub fn new_pipe() -> io::Result<(Sender, Receiver)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let receiver = Receiver { fd: fds[0] };
    let sender = Sender { fd: fds[1] };
    set_nonblocking_cloexec(receiver.fd)?;
    set_nonblocking_cloexec(sender.fd)?;
    Ok((sender, receiver))
}

/// Sending end of a Unix pipe, created with [`new_pipe`].
#[derive(Debug)]
pub struct Sender {
    fd: RawFd,
}

impl Sender {
    /// The underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Write for Sender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())
        };
        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        unsafe { let _ = libc::close(self.fd); }
    }
}

/// Receiving end of a Unix pipe, created with [`new_pipe`].
#[derive(Debug)]
pub struct Receiver {
    fd: RawFd,
}

impl Receiver {
    /// The underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Read for Receiver {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        unsafe { let _ = libc::close(self.fd); }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read, Write};

    use super::new_pipe;

    #[test]
    fn send_and_receive() {
        let (mut sender, mut receiver) = new_pipe().unwrap();

        let mut buf = [0u8; 20];
        // Nothing written yet.
        assert_eq!(receiver.read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);

        assert_eq!(sender.write(b"hello").unwrap(), 5);
        assert_eq!(receiver.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }
}
