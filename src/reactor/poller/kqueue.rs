//! kqueue backend for macOS and the BSDs.
//!
//! The wake channel is an `EVFILT_USER` event registered at creation and
//! keyed to the ignore index; periodic timers are `EVFILT_TIMER` filters
//! carrying the item pointer in `udata`.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use log::trace;

use super::super::{EV_BATCH_SIZE, IGNORE_INDEX};
use super::{CompletionEvent, EV_HUP, EV_IN, EV_OUT};

const WAKE_IDENT: usize = 0;

pub(crate) struct Poller {
    kq: RawFd,
    events: Vec<libc::kevent>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            let flags = libc::fcntl(kq, libc::F_GETFD);
            libc::fcntl(kq, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }

        // The wake channel: triggered from any thread via NOTE_TRIGGER,
        // auto-reset by EV_CLEAR, ignored by dispatch.
        let wake = kev(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR,
            0,
            0,
            IGNORE_INDEX,
        );
        let res = unsafe { libc::kevent(kq, &wake, 1, ptr::null_mut(), 0, ptr::null()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(err);
        }

        trace!("created kqueue fd {}", kq);

        Ok(Poller {
            kq,
            events: vec![unsafe { mem::zeroed() }; EV_BATCH_SIZE],
        })
    }

    /// Duplicate the kqueue descriptor for remote threads; `kevent` on the
    /// dup targets the same kernel queue.
    pub(crate) fn wake_handle(&self) -> io::Result<WakeHandle> {
        let fd = unsafe { libc::fcntl(self.kq, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeHandle { fd })
    }

    /// Register `fd`, one clear-on-read filter per requested direction.
    pub(crate) fn arm(&mut self, fd: RawFd, mask: u32, user_data: u64) -> io::Result<()> {
        let mut changes = [kev(0, 0, 0, 0, 0, 0); 2];
        let mut n = 0;

        if mask & EV_IN != 0 {
            changes[n] = kev(
                fd as usize,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_CLEAR,
                0,
                0,
                user_data,
            );
            n += 1;
        }
        if mask & EV_OUT != 0 {
            changes[n] = kev(
                fd as usize,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_CLEAR,
                0,
                0,
                user_data,
            );
            n += 1;
        }

        let res = unsafe {
            libc::kevent(self.kq, changes.as_ptr(), n as i32, ptr::null_mut(), 0, ptr::null())
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Remove `fd` from both filters. Errors are ignored: the descriptor
    /// may have been registered for a single direction.
    pub(crate) fn disarm(&mut self, fd: RawFd) -> io::Result<()> {
        let changes = [
            kev(fd as usize, libc::EVFILT_READ, libc::EV_DELETE, 0, 0, 0),
            kev(fd as usize, libc::EVFILT_WRITE, libc::EV_DELETE, 0, 0, 0),
        ];

        unsafe {
            libc::kevent(self.kq, changes.as_ptr(), 2, ptr::null_mut(), 0, ptr::null());
        }
        Ok(())
    }

    /// Fetch up to [`EV_BATCH_SIZE`] events. `timeout_ms < 0` blocks
    /// indefinitely, `0` polls, `> 0` waits with millisecond precision.
    /// `EINTR` surfaces as `ErrorKind::Interrupted`; the caller retries.
    pub(crate) fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let ts;
        let ts_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            &ts as *const libc::timespec
        };

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                EV_BATCH_SIZE as i32,
                ts_ptr,
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
        let user_data = ev.udata as usize as u64;

        if ev.filter == libc::EVFILT_TIMER {
            return CompletionEvent {
                user_data,
                mask: 0,
                err: 0,
                timer: true,
            };
        }

        let mask = if ev.flags & libc::EV_EOF != 0 {
            EV_HUP
        } else {
            match ev.filter {
                libc::EVFILT_READ => EV_IN,
                libc::EVFILT_WRITE => EV_OUT,
                _ => 0,
            }
        };

        CompletionEvent {
            user_data,
            mask,
            err: ev.fflags as i32,
            timer: false,
        }
    }

    /// Register a periodic kernel timer firing every `period`.
    pub(crate) fn add_timer(
        &mut self,
        ident: usize,
        period: Duration,
        user_data: u64,
    ) -> io::Result<()> {
        let msec = period.as_millis().min(i64::MAX as u128) as i64;
        let change = kev(
            ident,
            libc::EVFILT_TIMER,
            libc::EV_ADD | libc::EV_ENABLE,
            0,
            msec,
            user_data,
        );

        let res = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn remove_timer(&mut self, ident: usize) -> io::Result<()> {
        let change = kev(ident, libc::EVFILT_TIMER, libc::EV_DELETE, 0, 0, 0);

        let res = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

/// Remote-thread wake: NOTE_TRIGGER on the user filter. Triggers coalesce
/// until the reactor observes the event, so N calls unblock at least one
/// and at most N waits.
pub(crate) struct WakeHandle {
    fd: RawFd,
}

impl WakeHandle {
    pub(crate) fn wake(&self) {
        let change = kev(WAKE_IDENT, libc::EVFILT_USER, 0, libc::NOTE_TRIGGER, 0, IGNORE_INDEX);
        unsafe {
            libc::kevent(self.fd, &change, 1, ptr::null_mut(), 0, ptr::null());
        }
    }
}

impl Drop for WakeHandle {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

// Field-by-field construction keeps this building on targets whose kevent
// struct carries extra fields (FreeBSD's ext array).
fn kev(ident: usize, filter: i16, flags: u16, fflags: u32, data: i64, udata: u64) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev.data = data as _;
    ev.udata = udata as usize as *mut libc::c_void;
    ev
}
