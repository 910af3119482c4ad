mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::{wait_until, ReactorFixture};
use strand::{NullScheduler, Reactor};

#[test]
fn stop_while_parked_exits_within_one_wake() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (handle_tx, handle_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let reactor_thread = thread::spawn(move || {
        let mut reactor = Reactor::new().expect("failed to create reactor");
        reactor.init(3);
        handle_tx.send(reactor.handle()).unwrap();

        reactor.main_loop(&mut NullScheduler);
        done_tx.send(reactor.stats()).unwrap();
    });
    let handle = handle_rx.recv().unwrap();

    // Let the loop park indefinitely, then stop and deliver one wake.
    thread::sleep(Duration::from_millis(50));
    handle.stop();
    handle.wake();

    let stats = done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("loop did not exit after stop + wake");
    reactor_thread.join().unwrap();

    assert!(stats.num_stalls >= 1, "the loop should have parked before the stop");
}

#[test]
fn wakes_are_idempotent() {
    let fixture = ReactorFixture::spawn();

    thread::sleep(Duration::from_millis(20));
    for _ in 0..100 {
        fixture.handle.wake();
    }
    assert!(fixture.handle.wakeup_count() >= 100);

    // The reactor is still healthy and serving submissions.
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        fixture.handle.dispatch(move |_| ran.store(true, Ordering::SeqCst));
    }
    assert!(wait_until(Duration::from_secs(2), || ran.load(Ordering::SeqCst)));

    fixture.join();
}

#[test]
fn idle_tasks_run_only_when_nothing_else_progresses() {
    let _ = env_logger::builder().is_test(true).try_init();

    let idle_ran = Arc::new(AtomicBool::new(false));
    let idle_flag = idle_ran.clone();

    let (handle_tx, handle_rx) = mpsc::channel();
    let reactor_thread = thread::spawn(move || {
        let mut reactor = Reactor::new().expect("failed to create reactor");
        reactor.init(0);
        reactor.add_on_idle_task(move || {
            idle_flag.store(true, Ordering::SeqCst);
            false
        });
        handle_tx.send(reactor.handle()).unwrap();

        reactor.main_loop(&mut NullScheduler);
    });
    let handle = handle_rx.recv().unwrap();

    assert!(wait_until(Duration::from_secs(2), || idle_ran.load(Ordering::SeqCst)));

    handle.shutdown();
    reactor_thread.join().unwrap();
}
