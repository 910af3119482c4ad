//! Bounded lock-free queue feeding closures from foreign threads into the
//! reactor, plus the availability notifier that parks producers while the
//! queue is full.

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use super::core::Reactor;

/// A closure executed once on the reactor thread.
pub(crate) type Tasklet = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

pub(crate) struct TaskQueue {
    queue: ArrayQueue<Tasklet>,
    // Generation counter under the notifier lock; notify_available bumps
    // it so a parked producer can tell a signal from a spurious wake.
    avail_gen: Mutex<u64>,
    avail: Condvar,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        TaskQueue {
            queue: ArrayQueue::new(capacity),
            avail_gen: Mutex::new(0),
            avail: Condvar::new(),
        }
    }

    /// Enqueue from any thread, blocking while the queue is full. Tasks
    /// pushed by one thread are consumed in push order.
    pub(crate) fn push(&self, task: Tasklet) {
        let mut task = task;
        loop {
            match self.queue.push(task) {
                Ok(()) => return,
                Err(rejected) => task = rejected,
            }

            let mut gen = self.avail_gen.lock();
            // Retry under the lock: a drain that signalled before we got
            // here already made room, and any later drain must bump the
            // generation we are about to sleep on.
            match self.queue.push(task) {
                Ok(()) => return,
                Err(rejected) => task = rejected,
            }

            let seen = *gen;
            while *gen == seen {
                self.avail.wait(&mut gen);
            }
        }
    }

    /// Reactor-side dequeue.
    pub(crate) fn pop(&self) -> Option<Tasklet> {
        self.queue.pop()
    }

    /// Signal producers that the queue has (partially) drained.
    pub(crate) fn notify_available(&self) {
        let mut gen = self.avail_gen.lock();
        *gen = gen.wrapping_add(1);
        self.avail.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_within_capacity() {
        let queue = TaskQueue::new(8);
        for _ in 0..3 {
            queue.push(Box::new(|_| {}));
        }
        let mut popped = 0;
        while queue.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 3);
    }

    #[test]
    fn full_queue_parks_producer_until_drained() {
        let queue = Arc::new(TaskQueue::new(2));
        queue.push(Box::new(|_| {}));
        queue.push(Box::new(|_| {}));

        let pushed = Arc::new(AtomicUsize::new(0));
        let producer = {
            let queue = queue.clone();
            let pushed = pushed.clone();
            thread::spawn(move || {
                queue.push(Box::new(|_| {}));
                pushed.store(1, Ordering::SeqCst);
            })
        };

        // The producer must be parked on the notifier, not spinning.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 0);

        queue.pop().unwrap();
        queue.notify_available();

        producer.join().unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 1);
    }
}
