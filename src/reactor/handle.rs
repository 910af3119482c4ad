//! Cross-thread handle to a reactor.
//!
//! The shared state below is the only part of a reactor remote threads may
//! touch: the task queue, the park/wake rendezvous word, the stop flag,
//! and the wake channel. Everything else is owned by the reactor thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;

use super::core::Reactor;
use super::poller::WakeHandle;
use super::queue::{TaskQueue, Tasklet};

/// Distinguished `tq_seq` value marking the reactor's intent to park.
/// Producers bump `tq_seq` by 2 per submission, so the loop's CAS from its
/// snapshot to this value fails whenever a task slipped in since the
/// snapshot; this eventcount closes the lost-wakeup window.
pub(crate) const WAIT_SECTION_STATE: u32 = 1 << 31;

pub(crate) struct Shared {
    pub(crate) task_queue: TaskQueue,
    pub(crate) tq_seq: AtomicU32,
    pub(crate) is_stopped: AtomicBool,
    pub(crate) tq_wakeup_ev: AtomicU64,
    pub(crate) wake: WakeHandle,
}

impl Shared {
    pub(crate) fn new(queue_capacity: usize, wake: WakeHandle) -> Self {
        Shared {
            task_queue: TaskQueue::new(queue_capacity),
            tq_seq: AtomicU32::new(0),
            is_stopped: AtomicBool::new(false),
            tq_wakeup_ev: AtomicU64::new(0),
            wake,
        }
    }

    pub(crate) fn wake_ring(&self) {
        trace!("waking reactor, tq_seq={}", self.tq_seq.load(Ordering::Relaxed));
        self.tq_wakeup_ev.fetch_add(1, Ordering::Relaxed);
        self.wake.wake();
    }

    // The submission half of the eventcount rendezvous: bump the sequence,
    // and fire the wake channel only if the reactor had declared intent to
    // park. Subsequent submissions while it is parked see the bumped value
    // and coalesce into the pending wakeup.
    fn wakeup_if_needed(&self) {
        let prev = self.tq_seq.fetch_add(2, Ordering::Relaxed);
        if prev == WAIT_SECTION_STATE {
            self.wake_ring();
        }
    }
}

/// Cloneable, `Send` handle for submitting work to a reactor and stopping
/// it from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        ReactorHandle { shared }
    }

    /// Submit a closure for execution on the reactor thread.
    ///
    /// Callable from any thread. Blocks while the queue is full; the
    /// reactor signals availability as it drains. Tasks submitted by one
    /// thread run in submission order.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.dispatch_boxed(Box::new(task));
    }

    pub(crate) fn dispatch_boxed(&self, task: Tasklet) {
        self.shared.task_queue.push(task);
        self.shared.wakeup_if_needed();
    }

    /// Deliver one wakeup to the reactor. Idempotent: concurrent wakes
    /// coalesce into at least one return from the kernel wait.
    pub fn wake(&self) {
        self.shared.wake_ring();
    }

    /// Request loop exit. The loop observes the flag at its next parking
    /// attempt, after all pending events have been drained; pair with
    /// [`wake`](Self::wake) (or use [`shutdown`](Self::shutdown)) if the
    /// reactor may currently be parked.
    pub fn stop(&self) {
        self.shared.is_stopped.store(true, Ordering::Release);
    }

    /// `stop` plus a wake, so a parked reactor exits promptly.
    pub fn shutdown(&self) {
        self.stop();
        self.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped.load(Ordering::Acquire)
    }

    /// Number of cross-thread wakeups delivered so far.
    pub fn wakeup_count(&self) -> u64 {
        self.shared.tq_wakeup_ev.load(Ordering::Relaxed)
    }
}
