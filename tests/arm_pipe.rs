mod common;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::{wait_until, ReactorFixture};
use strand::EV_IN;

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe() failed");
    (fds[0], fds[1])
}

#[test]
fn edge_triggered_pipe_callback() {
    let fixture = ReactorFixture::spawn();
    let (rfd, wfd) = pipe();

    let hits = Arc::new(AtomicUsize::new(0));
    let (handle_tx, handle_rx) = mpsc::channel();
    {
        let hits = hits.clone();
        fixture.handle.dispatch(move |reactor| {
            let hits = hits.clone();
            let handle = reactor
                .arm(
                    rfd,
                    move |_mask, _err, _reactor| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    },
                    EV_IN,
                )
                .expect("arm failed");
            handle_tx.send(handle).unwrap();
        });
    }
    let arm_handle = handle_rx.recv().unwrap();

    // Three remote writes with nothing draining the pipe in between:
    // edge-triggered readiness may coalesce them, but at least one
    // callback must fire.
    for _ in 0..3 {
        let n = unsafe { libc::write(wfd, [7u8; 4].as_ptr() as *const libc::c_void, 4) };
        assert_eq!(n, 4);
        thread::sleep(Duration::from_millis(10));
    }

    assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 1));

    // The callback never consumed anything, so all 12 bytes are still
    // buffered after the last invocation.
    let (read_tx, read_rx) = mpsc::channel();
    fixture.handle.dispatch(move |reactor| {
        reactor.disarm(rfd, arm_handle).unwrap();

        let mut buf = [0u8; 64];
        let n = unsafe { libc::read(rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        read_tx.send(n).unwrap();
    });
    assert_eq!(read_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 12);

    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
    fixture.join();
}

#[test]
fn disarmed_fd_gets_no_more_callbacks() {
    let fixture = ReactorFixture::spawn();
    let (rfd, wfd) = pipe();

    let hits = Arc::new(AtomicUsize::new(0));
    let (handle_tx, handle_rx) = mpsc::channel();
    {
        let hits = hits.clone();
        fixture.handle.dispatch(move |reactor| {
            let hits = hits.clone();
            let handle = reactor
                .arm(
                    rfd,
                    move |_mask, _err, _reactor| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    },
                    EV_IN,
                )
                .expect("arm failed");
            handle_tx.send(handle).unwrap();
        });
    }
    let arm_handle = handle_rx.recv().unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    fixture.handle.dispatch(move |reactor| {
        reactor.disarm(rfd, arm_handle).unwrap();
        done_tx.send(()).unwrap();
    });
    done_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let n = unsafe { libc::write(wfd, [1u8; 1].as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(hits.load(Ordering::SeqCst), 0);

    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
    fixture.join();
}
