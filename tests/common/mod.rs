#![allow(dead_code)]

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use strand::{NullScheduler, Reactor, ReactorHandle, ReactorStats};

/// A reactor running its main loop on a dedicated thread, driven through
/// its handle from the test thread.
pub struct ReactorFixture {
    pub handle: ReactorHandle,
    thread: Option<thread::JoinHandle<ReactorStats>>,
}

impl ReactorFixture {
    pub fn spawn() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let mut reactor = Reactor::new().expect("failed to create reactor");
            reactor.init(0);
            tx.send(reactor.handle()).unwrap();

            reactor.main_loop(&mut NullScheduler);
            reactor.stats()
        });

        ReactorFixture {
            handle: rx.recv().unwrap(),
            thread: Some(thread),
        }
    }

    /// Stop the reactor and return its final loop counters.
    pub fn join(mut self) -> ReactorStats {
        self.handle.shutdown();
        self.thread
            .take()
            .unwrap()
            .join()
            .expect("reactor thread panicked")
    }
}

impl Drop for ReactorFixture {
    fn drop(&mut self) {
        // Covers tests that assert-fail before joining; the loop exits
        // and the detached thread winds down on its own.
        self.handle.shutdown();
    }
}

pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    pred()
}
