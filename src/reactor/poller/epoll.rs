//! epoll backend for Linux, with an eventfd wake channel and timerfd
//! helpers for periodic timers.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use log::trace;

use super::super::{EV_BATCH_SIZE, IGNORE_INDEX};
use super::{CompletionEvent, EV_ERR, EV_HUP, EV_IN, EV_OUT};

pub(crate) struct Poller {
    epoll_fd: RawFd,
    wake_fd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        trace!("created epoll fd {} with wake fd {}", epoll_fd, wake_fd);

        Ok(Poller {
            epoll_fd,
            wake_fd,
            events: vec![libc::epoll_event { events: 0, u64: IGNORE_INDEX }; EV_BATCH_SIZE],
        })
    }

    /// Read end of the wake channel. The reactor arms it like any other
    /// descriptor and drains it in the resulting callback.
    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake_fd
    }

    /// Duplicate the wake channel for remote threads. The dup keeps the
    /// handle usable independently of the poller's lifetime.
    pub(crate) fn wake_handle(&self) -> io::Result<WakeHandle> {
        let fd = unsafe { libc::fcntl(self.wake_fd, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeHandle { fd })
    }

    pub(crate) fn arm(&mut self, fd: RawFd, mask: u32, user_data: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: native_interest(mask) | libc::EPOLLET as u32,
            u64: user_data,
        };

        let res = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn disarm(&mut self, fd: RawFd) -> io::Result<()> {
        let res =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Fetch up to [`EV_BATCH_SIZE`] events. `timeout_ms < 0` blocks
    /// indefinitely, `0` polls, `> 0` waits with millisecond precision.
    /// `EINTR` surfaces as `ErrorKind::Interrupted`; the caller retries.
    pub(crate) fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                EV_BATCH_SIZE as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Normalized view of the i-th event of the last `wait`.
    pub(crate) fn event(&self, i: usize) -> CompletionEvent {
        let ev = self.events[i];
        CompletionEvent {
            user_data: ev.u64,
            mask: abstract_mask(ev.events),
            err: 0,
            timer: false,
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

/// Write end of the wake channel; safe to use from any thread. Wakes
/// coalesce in the eventfd counter, so N calls unblock at least one and
/// at most N waits.
pub(crate) struct WakeHandle {
    fd: RawFd,
}

impl WakeHandle {
    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        let res =
            unsafe { libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8) };
        // EAGAIN means the counter is saturated; a wakeup is pending anyway.
        debug_assert!(res == 8 || io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock);
    }
}

impl Drop for WakeHandle {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn native_interest(mask: u32) -> u32 {
    let mut events = 0;
    if mask & EV_IN != 0 {
        events |= libc::EPOLLIN as u32;
    }
    if mask & EV_OUT != 0 {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn abstract_mask(events: u32) -> u32 {
    let mut mask = 0;
    if events & libc::EPOLLIN as u32 != 0 {
        mask |= EV_IN;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask |= EV_OUT;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        mask |= EV_ERR;
    }
    if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        mask |= EV_HUP;
    }
    mask
}

/// Create a monotonic, non-blocking, close-on-exec timer descriptor.
pub(crate) fn create_timer() -> io::Result<RawFd> {
    let tfd = unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    };
    if tfd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(tfd)
}

/// Program `tfd` to fire every `period`, starting one period from now.
pub(crate) fn start_timer(tfd: RawFd, period: Duration) -> io::Result<()> {
    let spec = libc::itimerspec {
        it_interval: timespec(period),
        it_value: timespec(period),
    };
    let res = unsafe { libc::timerfd_settime(tfd, 0, &spec, ptr::null_mut()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Consume the expiration count so edge-triggered readiness re-arms.
pub(crate) fn drain_timer(tfd: RawFd) -> io::Result<u64> {
    read_counter(tfd)
}

/// Consume pending wakeups from the eventfd.
pub(crate) fn drain_eventfd(fd: RawFd) -> io::Result<u64> {
    read_counter(fd)
}

fn read_counter(fd: RawFd) -> io::Result<u64> {
    let mut val = 0u64;
    let n = unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        return Err(io::Error::last_os_error());
    }
    Ok(val)
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}
