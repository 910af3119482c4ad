//! Thin non-blocking descriptor surface bound to a reactor.
//!
//! The full socket abstraction (connect/accept/shutdown state machines)
//! lives above the reactor; this type carries the descriptor plus its
//! arm/disarm registration so callers cannot leak one without the other.

use std::io;
use std::os::unix::io::RawFd;

use crate::reactor::{ArmHandle, Reactor};

/// A non-blocking descriptor owned by a reactor thread. Created through
/// [`Reactor::create_socket`].
pub struct Socket {
    fd: RawFd,
    armed: Option<ArmHandle>,
}

impl Socket {
    pub(crate) fn new() -> Self {
        Socket { fd: -1, armed: None }
    }

    /// Adopt an existing descriptor, switching it to non-blocking mode.
    /// The socket owns the descriptor from here on.
    pub fn open(&mut self, fd: RawFd) -> io::Result<()> {
        assert!(self.fd < 0, "socket already open");

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }

        self.fd = fd;
        Ok(())
    }

    pub fn native_handle(&self) -> RawFd {
        self.fd
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Install a readiness callback for this descriptor on `reactor`.
    pub fn arm<F>(&mut self, reactor: &mut Reactor, cb: F, mask: u32) -> io::Result<()>
    where
        F: Fn(u32, i32, &mut Reactor) + 'static,
    {
        assert!(self.fd >= 0, "socket is not open");
        assert!(self.armed.is_none(), "socket already armed");

        self.armed = Some(reactor.arm(self.fd, cb, mask)?);
        Ok(())
    }

    pub fn disarm(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        let handle = self.armed.take().expect("socket is not armed");
        reactor.disarm(self.fd, handle)
    }

    /// Non-blocking read; `WouldBlock` once the descriptor is drained.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // The kernel drops any remaining registration with the last close.
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}
