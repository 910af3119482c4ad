//! Uniform surface over the platform readiness mechanism.
//!
//! The reactor core talks to a single `Poller` type with arm/disarm/wait
//! operations and a normalized event shape; everything backend-specific
//! stays behind this module. Registrations are always edge-triggered:
//! consumers are fiber-driven and may suspend with data left unread, so
//! level-triggered reporting would force a re-arm on every drain.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use self::epoll::{
    create_timer, drain_eventfd, drain_timer, start_timer, Poller, WakeHandle,
};

// The kqueue backend needs EVFILT_USER for the wake channel, which rules
// out OpenBSD.
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
pub(crate) use self::kqueue::{Poller, WakeHandle};

/// Readable readiness.
pub const EV_IN: u32 = 0x1;
/// Writable readiness.
pub const EV_OUT: u32 = 0x4;
/// Error condition on the descriptor.
pub const EV_ERR: u32 = 0x8;
/// Peer hang-up (`EPOLLHUP`/`EPOLLRDHUP`, `EV_EOF`).
pub const EV_HUP: u32 = 0x10;

/// A readiness event normalized across backends.
///
/// `timer` marks kqueue periodic-timer filters, which carry an item
/// pointer in `user_data` and bypass the completion table.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CompletionEvent {
    pub user_data: u64,
    pub mask: u32,
    pub err: i32,
    pub timer: bool,
}
