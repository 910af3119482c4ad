mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{wait_until, ReactorFixture};

#[test]
fn tasks_run_in_submission_order() {
    let fixture = ReactorFixture::spawn();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10 {
        let order = order.clone();
        fixture.handle.dispatch(move |_| order.lock().unwrap().push(i));
    }

    assert!(wait_until(Duration::from_secs(2), || order
        .lock()
        .unwrap()
        .len()
        == 10));
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());

    fixture.join();
}

#[test]
fn parked_reactor_runs_submissions_from_many_threads() {
    let fixture = ReactorFixture::spawn();

    // Give the loop time to park before the burst.
    thread::sleep(Duration::from_millis(50));

    let counter = Arc::new(AtomicUsize::new(0));
    let producers: Vec<_> = (0..4)
        .map(|_| {
            let handle = fixture.handle.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let counter = counter.clone();
                    handle.dispatch(move |_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || counter
        .load(Ordering::Relaxed)
        == 4000));
    assert!(fixture.handle.wakeup_count() >= 1);

    let stats = fixture.join();
    assert_eq!(stats.num_task_runs, 4000);
}

#[test]
fn long_drains_yield_back_to_the_loop() {
    let fixture = ReactorFixture::spawn();

    // A single task overshooting the drain budget must be accounted as an
    // interrupted drain; the queue keeps flowing afterwards.
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = ran.clone();
        fixture.handle.dispatch(move |_| {
            let start = Instant::now();
            while start.elapsed() < Duration::from_micros(700) {
                std::hint::spin_loop();
            }
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    {
        let ran = ran.clone();
        fixture.handle.dispatch(move |_| {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert!(wait_until(Duration::from_secs(2), || ran.load(Ordering::Relaxed) == 2));

    let stats = fixture.join();
    assert!(stats.task_interrupts >= 1);
    assert_eq!(stats.num_task_runs, 2);
}
