//! Per-thread I/O reactor for cooperatively scheduled fibers.
//!
//! Each [`Reactor`] owns one kernel readiness queue (epoll on Linux, kqueue
//! on BSD-like systems) and interleaves four event sources on a single
//! thread: closures submitted by other threads, ready fibers, kernel
//! completions, and periodic timers. A higher-level pool is expected to run
//! one reactor per worker thread.
//!
//! # Architecture
//!
//! - **Reactor**: the main loop plus the completion table mapping compact
//!   integer handles to readiness callbacks
//! - **ReactorHandle**: cloneable, `Send` handle for remote threads to
//!   submit work, wake, and stop the reactor
//! - **Scheduler**: the fiber-scheduler seam the loop drives; fibers
//!   themselves live outside this crate
//! - **Socket**: factory surface for non-blocking descriptors bound to a
//!   reactor
//!
//! All mutating reactor methods must run on the owning thread; the handle
//! is the only cross-thread entry point.

pub mod reactor;
pub mod scheduler;
mod socket;

pub use reactor::{ArmHandle, PeriodicItem, Reactor, ReactorHandle, ReactorStats};
pub use reactor::{EV_ERR, EV_HUP, EV_IN, EV_OUT};
pub use scheduler::{NullScheduler, Scheduler};
pub use socket::Socket;
