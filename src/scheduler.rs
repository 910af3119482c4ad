//! The fiber-scheduler seam driven by the reactor loop.
//!
//! Fiber state (stacks, switching, synchronization) lives outside this
//! crate; the loop only needs the narrow interface below to decide when it
//! may park and to hand the CPU to ready fibers between I/O batches. All
//! methods are invoked on the reactor thread.

use std::time::Instant;

pub trait Scheduler {
    /// Ingest fibers made runnable by other threads since the last call.
    fn process_remote_ready(&mut self);

    /// Whether any fiber is ready to run right now. The loop never parks
    /// while this reports `true`.
    fn has_ready(&self) -> bool;

    /// Run one step of ready worker fibers. Returns `true` when more work
    /// remains, which suppresses the loop's idle back-off for the next
    /// iteration.
    fn run_worker_fibers_step(&mut self) -> bool;

    fn has_sleeping_fibers(&self) -> bool;

    /// Deadline of the nearest sleeping fiber. Only called when
    /// [`has_sleeping_fibers`](Self::has_sleeping_fibers) reports `true`;
    /// an indefinite park is clamped to this point.
    fn next_sleep_point(&self) -> Instant;

    /// Reclaim fibers that have finished. Called on idle iterations only.
    fn destroy_terminated(&mut self);

    /// Low-priority maintenance tasks, run once per loop iteration after
    /// completion dispatch.
    fn run_l2_tasks(&mut self);
}

/// A scheduler with no fibers, for reactors used purely for remote tasks,
/// readiness callbacks and periodic timers.
#[derive(Default)]
pub struct NullScheduler;

impl Scheduler for NullScheduler {
    fn process_remote_ready(&mut self) {}

    fn has_ready(&self) -> bool {
        false
    }

    fn run_worker_fibers_step(&mut self) -> bool {
        false
    }

    fn has_sleeping_fibers(&self) -> bool {
        false
    }

    fn next_sleep_point(&self) -> Instant {
        Instant::now()
    }

    fn destroy_terminated(&mut self) {}

    fn run_l2_tasks(&mut self) {}
}
