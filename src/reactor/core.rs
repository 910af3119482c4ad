use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace};

use crate::scheduler::Scheduler;
use crate::socket::Socket;

use super::handle::{ReactorHandle, Shared, WAIT_SECTION_STATE};
use super::poller::{CompletionEvent, Poller};
use super::queue::Tasklet;
use super::table::{ArmHandle, CompletionTable};
use super::{
    DEFAULT_QUEUE_CAPACITY, EV_BATCH_SIZE, IGNORE_INDEX, INIT_TABLE_CAPACITY, MAX_SPIN_LIMIT,
    TASK_DRAIN_BUDGET, TASK_NOTIFY_QUANTUM, USER_DATA_CB_INDEX,
};

#[cfg(target_os = "linux")]
use super::poller::{create_timer, drain_eventfd, drain_timer, start_timer};
#[cfg(target_os = "linux")]
use super::EV_IN;

/// Loop counters, readable on the reactor thread via [`Reactor::stats`].
/// The cross-thread wakeup counter lives on [`ReactorHandle`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ReactorStats {
    pub loop_cnt: u64,
    pub num_task_runs: u64,
    pub num_stalls: u64,
    pub completions_fetches: u64,
    pub num_suspends: u64,
    pub task_interrupts: u64,
}

/// A recurring task owned by the reactor once scheduled.
///
/// `val1`/`val2` hold the platform handles: the timerfd and completion
/// handle on Linux, the kqueue timer ident on BSD-likes. `ref_cnt` must
/// read zero before the item may be reclaimed.
pub struct PeriodicItem {
    period: Duration,
    task: RefCell<Box<dyn FnMut()>>,
    val1: Cell<RawFd>,
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    val2: Cell<u32>,
    ref_cnt: Cell<u32>,
}

impl PeriodicItem {
    pub fn new(period: Duration, task: impl FnMut() + 'static) -> Rc<Self> {
        Rc::new(PeriodicItem {
            period,
            task: RefCell::new(Box::new(task)),
            val1: Cell::new(-1),
            val2: Cell::new(0),
            ref_cnt: Cell::new(0),
        })
    }
}

/// A single-threaded event loop multiplexing remote task submissions,
/// ready fibers, kernel readiness completions and periodic timers.
///
/// Construct with [`new`](Self::new), call [`init`](Self::init) once on
/// the owning thread, then drive a scheduler with
/// [`main_loop`](Self::main_loop) until a remote [`ReactorHandle::stop`].
/// Every mutating method asserts the owning thread.
pub struct Reactor {
    poller: Poller,
    centries: CompletionTable,
    shared: Arc<Shared>,
    periodics: HashMap<u32, Rc<PeriodicItem>>,
    next_periodic_id: u32,
    on_idle: Vec<Box<dyn FnMut() -> bool>>,
    stats: ReactorStats,
    pool_index: u32,
    owner: Option<ThreadId>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> io::Result<Self> {
        let poller = Poller::new()?;
        let wake = poller.wake_handle()?;

        Ok(Reactor {
            poller,
            centries: CompletionTable::new(INIT_TABLE_CAPACITY),
            shared: Arc::new(Shared::new(queue_capacity, wake)),
            periodics: HashMap::new(),
            next_periodic_id: 1,
            on_idle: Vec::new(),
            stats: ReactorStats::default(),
            pool_index: 0,
            owner: None,
        })
    }

    /// Bind the reactor to the current thread and its position in the
    /// owning pool. Must be called exactly once, on the thread that will
    /// run [`main_loop`](Self::main_loop).
    pub fn init(&mut self, pool_index: u32) {
        assert!(self.owner.is_none(), "init was already called");
        self.owner = Some(thread::current().id());
        self.pool_index = pool_index;

        // On Linux the wake channel is an ordinary armed descriptor; the
        // callback's only job is to drain the eventfd counter. kqueue
        // wakes arrive as user-filter events and are dropped by dispatch.
        #[cfg(target_os = "linux")]
        {
            let wake_fd = self.poller.wake_fd();
            self.arm(
                wake_fd,
                move |_mask, _err, _reactor| {
                    if let Err(err) = drain_eventfd(wake_fd) {
                        if err.kind() != io::ErrorKind::WouldBlock {
                            error!("error draining wake channel: {err}");
                        }
                    }
                },
                EV_IN,
            )
            .expect("failed to arm the wake channel");
        }
    }

    /// Cloneable cross-thread handle for task submission, wake and stop.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle::new(self.shared.clone())
    }

    pub fn stats(&self) -> ReactorStats {
        self.stats
    }

    pub fn pool_index(&self) -> u32 {
        self.pool_index
    }

    /// Install `cb` for readiness events on `fd`, edge-triggered.
    ///
    /// The registration is multishot: the callback stays installed until
    /// [`disarm`](Self::disarm). The callback receives the readiness mask,
    /// a backend error code, and the reactor for the duration of the call.
    pub fn arm<F>(&mut self, fd: RawFd, cb: F, mask: u32) -> io::Result<ArmHandle>
    where
        F: Fn(u32, i32, &mut Reactor) + 'static,
    {
        self.assert_owner("arm");

        let handle = self.centries.allocate(Rc::new(cb));
        debug!("arm: fd {} -> {:?}", fd, handle);

        if let Err(err) = self.poller.arm(fd, mask, handle.user_data()) {
            self.centries.release(handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Remove the registration `handle` for `fd`.
    ///
    /// The slot is released before the kernel deregistration, so a
    /// completion already queued for it finds a vacated slot and is
    /// dropped.
    pub fn disarm(&mut self, fd: RawFd, handle: ArmHandle) -> io::Result<()> {
        self.assert_owner("disarm");
        debug!("disarm: fd {} from {:?}", fd, handle);

        self.centries.release(handle);
        self.poller.disarm(fd)
    }

    /// Factory for a socket bound to this reactor.
    pub fn create_socket(&mut self) -> Socket {
        self.assert_owner("create_socket");
        Socket::new()
    }

    /// Register `item` as periodic task `id`; the reactor owns the item
    /// until [`cancel_periodic`](Self::cancel_periodic).
    pub fn schedule_periodic(&mut self, id: u32, item: Rc<PeriodicItem>) -> io::Result<()> {
        self.assert_owner("schedule_periodic");
        assert!(!self.periodics.contains_key(&id), "periodic id {id} already scheduled");

        item.ref_cnt.set(1);

        #[cfg(target_os = "linux")]
        {
            let tfd = create_timer()?;
            item.val1.set(tfd);

            let cb_item = item.clone();
            let handle = self.arm(
                tfd,
                move |_mask, _err, reactor| reactor.periodic_cb(&cb_item),
                EV_IN,
            )?;
            item.val2.set(handle.raw());

            start_timer(tfd, item.period)?;
        }

        #[cfg(not(target_os = "linux"))]
        {
            item.val1.set(id as RawFd);
            let user_data = Rc::as_ptr(&item) as usize as u64;
            self.poller.add_timer(id as usize, item.period, user_data)?;
        }

        self.periodics.insert(id, item);
        Ok(())
    }

    /// Tear down a periodic registration and reclaim the item.
    ///
    /// Neither epoll nor kqueue delivers completions after the disarm or
    /// filter delete, so the item is reclaimed synchronously once its
    /// `ref_cnt` observes zero.
    pub fn cancel_periodic(&mut self, item: &Rc<PeriodicItem>) {
        self.assert_owner("cancel_periodic");

        #[cfg(target_os = "linux")]
        {
            let tfd = item.val1.get();
            let handle = ArmHandle::from_raw(item.val2.get());
            self.disarm(tfd, handle)
                .expect("failed to disarm periodic timer");
            if unsafe { libc::close(tfd) } == -1 {
                error!("could not close timer fd: {}", io::Error::last_os_error());
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let ident = item.val1.get() as usize;
            self.poller
                .remove_timer(ident)
                .expect("failed to delete periodic timer filter");
        }

        item.ref_cnt.set(item.ref_cnt.get() - 1);
        assert_eq!(item.ref_cnt.get(), 0, "periodic item still referenced at cancellation");

        self.periodics.retain(|_, owned| !Rc::ptr_eq(owned, item));
    }

    /// Allocate an id and schedule `task` to run every `period`.
    pub fn add_periodic(&mut self, period: Duration, task: impl FnMut() + 'static) -> u32 {
        let id = self.next_periodic_id;
        self.next_periodic_id += 1;

        self.schedule_periodic(id, PeriodicItem::new(period, task))
            .expect("failed to schedule periodic task");
        id
    }

    pub fn remove_periodic(&mut self, id: u32) {
        let item = self.periodics.get(&id).cloned().expect("unknown periodic id");
        self.cancel_periodic(&item);
    }

    /// Register a task run on iterations that made no other progress.
    /// Returning `true` counts as progress and defers the spin back-off.
    pub fn add_on_idle_task(&mut self, task: impl FnMut() -> bool + 'static) {
        self.assert_owner("add_on_idle_task");
        self.on_idle.push(Box::new(task));
    }

    /// Run until a remote [`ReactorHandle::stop`] is observed at a parking
    /// attempt, i.e. after all pending events have been drained. The
    /// caller is responsible for stopping the incoming flow of events
    /// first.
    pub fn main_loop<S: Scheduler>(&mut self, scheduler: &mut S) {
        self.assert_owner("main_loop");
        debug!("PRO[{}] entering main loop", self.pool_index);

        let mut spin_loops: u32 = 0;

        loop {
            self.stats.loop_cnt += 1;
            let mut task_queue_exhausted = true;

            let tq_seq = self.shared.tq_seq.load(Ordering::Acquire);

            if let Some(first) = self.shared.task_queue.pop() {
                task_queue_exhausted = self.run_remote_tasks(first);
            }

            // Remote fiber wakeups are ingested inside the tq_seq section,
            // before the has_ready check below.
            scheduler.process_remote_ready();

            let mut timeout_ms: i32 = 0;

            // Blocking indefinitely is allowed only when the queue was
            // fully drained, no fiber is ready, and we have already spun a
            // few rounds. The CAS fails if any submission bumped tq_seq
            // since the snapshot, sending us around for another drain.
            if task_queue_exhausted && !scheduler.has_ready() && spin_loops >= MAX_SPIN_LIMIT {
                spin_loops = 0;
                if self
                    .shared
                    .tq_seq
                    .compare_exchange_weak(
                        tq_seq,
                        WAIT_SECTION_STATE,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // The stop flag is honored only with all pending
                    // events processed; the owner must quiesce the event
                    // flow before stopping the reactor.
                    if self.shared.is_stopped.load(Ordering::Acquire) {
                        break;
                    }
                    self.stats.num_stalls += 1;
                    timeout_ms = -1;

                    if scheduler.has_sleeping_fibers() {
                        timeout_ms = sleep_timeout_ms(Instant::now(), scheduler.next_sleep_point());
                    }
                }
            }

            trace!("kernel wait, timeout {} ms", timeout_ms);

            let wait_start = (timeout_ms != 0).then(Instant::now);
            let wait_res = self.poller.wait(timeout_ms);
            if let Some(start) = wait_start {
                self.stats.num_suspends += 1;
                trace!("resumed after {:?}", start.elapsed());
            }

            let count = match wait_res {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => panic!("kernel wait failed: {err}"),
            };

            // Leave the wait section so the next producer skips the wake.
            self.shared.tq_seq.store(0, Ordering::Release);

            let mut cqe_count = count;
            if cqe_count > 0 {
                self.stats.completions_fetches += 1;

                loop {
                    self.dispatch_completions(cqe_count);

                    if cqe_count < EV_BATCH_SIZE {
                        break;
                    }
                    // A full batch may mean more completions are queued;
                    // re-fetch without blocking until a short batch.
                    match self.poller.wait(0) {
                        Ok(n) if n > 0 => {
                            cqe_count = n;
                            self.stats.completions_fetches += 1;
                        }
                        _ => break,
                    }
                }
            }

            scheduler.run_l2_tasks();

            // One step, not a drain: worker fibers yield back so I/O
            // dispatch stays fair. More remaining work suppresses the
            // back-off below.
            if scheduler.run_worker_fibers_step() {
                cqe_count = 1;
            }

            if cqe_count > 0 {
                continue;
            }

            scheduler.destroy_terminated();
            if !self.run_on_idle_tasks() {
                pause(spin_loops);
                spin_loops += 1;
            }
        }

        info!(
            "PRO[{}] loops/stalls/fetches/suspends: {}/{}/{}/{} wakeups/interrupts: {}/{} centries: {}",
            self.pool_index,
            self.stats.loop_cnt,
            self.stats.num_stalls,
            self.stats.completions_fetches,
            self.stats.num_suspends,
            self.shared.tq_wakeup_ev.load(Ordering::Relaxed),
            self.stats.task_interrupts,
            self.centries.len(),
        );
    }

    // Runs queued remote tasks back to back, starting with `first`.
    // Returns false when the drain budget expired with tasks left over.
    fn run_remote_tasks(&mut self, first: Tasklet) -> bool {
        let drain_start = Instant::now();
        let mut task = first;
        let mut cnt: u32 = 0;

        loop {
            task(self);
            self.stats.num_task_runs += 1;
            cnt += 1;

            if drain_start.elapsed() >= TASK_DRAIN_BUDGET {
                self.stats.task_interrupts += 1;
                trace!("remote drain interrupted after {} tasks", cnt);
                self.shared.task_queue.notify_available();
                return false;
            }

            if cnt % TASK_NOTIFY_QUANTUM == 0 {
                // Let blocked producers refill while we keep unloading.
                self.shared.task_queue.notify_available();
            }

            match self.shared.task_queue.pop() {
                Some(next) => task = next,
                None => break,
            }
        }

        trace!("ran {} remote tasks", cnt);
        self.shared.task_queue.notify_available();
        true
    }

    fn dispatch_completions(&mut self, count: usize) {
        trace!("dispatching {} completions", count);
        for i in 0..count {
            let ev = self.poller.event(i);
            self.dispatch_event(ev);
        }
    }

    // Callbacks run in kernel-returned order within a batch.
    fn dispatch_event(&mut self, ev: CompletionEvent) {
        if ev.timer {
            // kqueue periodic timers bypass the completion table; the
            // item pointer rides in user_data.
            #[cfg(not(target_os = "linux"))]
            self.dispatch_timer(ev.user_data);
            return;
        }

        if ev.user_data >= USER_DATA_CB_INDEX {
            let live = ArmHandle::from_user_data(ev.user_data)
                .and_then(|handle| self.centries.get(handle));
            match live {
                Some(cb) => cb(ev.mask, ev.err, self),
                // Registrations are multishot and may complete after a
                // disarm, or after the slot moved to a new tenant; such
                // events are dropped here.
                None => trace!("dropping stale completion, user_data {}", ev.user_data),
            }
            return;
        }

        if ev.user_data == IGNORE_INDEX {
            return;
        }

        error!("unrecognized user_data {}", ev.user_data);
    }

    #[cfg(not(target_os = "linux"))]
    fn dispatch_timer(&mut self, user_data: u64) {
        // The pointer stays valid while the filter is registered: the
        // registry holds the Rc, and kqueue delivers nothing after the
        // EV_DELETE issued by cancel_periodic.
        let item = unsafe { &*(user_data as usize as *const PeriodicItem) };
        self.periodic_cb(item);
    }

    fn periodic_cb(&mut self, item: &PeriodicItem) {
        assert!(item.ref_cnt.get() > 0);

        (item.task.borrow_mut())();

        #[cfg(target_os = "linux")]
        if let Err(err) = drain_timer(item.val1.get()) {
            error!("error reading from timer: {err}");
        }
    }

    fn run_on_idle_tasks(&mut self) -> bool {
        let mut did_work = false;
        for task in &mut self.on_idle {
            did_work |= task();
        }
        did_work
    }

    fn assert_owner(&self, what: &str) {
        assert_eq!(
            self.owner,
            Some(thread::current().id()),
            "{what} must run on the reactor thread"
        );
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if self.owner.is_some()
            && !self.shared.is_stopped.load(Ordering::Acquire)
            && !thread::panicking()
        {
            panic!("reactor dropped while running; stop it first");
        }
    }
}

// The kernel wait has millisecond precision; round the distance to the
// nearest sleep deadline up so we never wake early and spin against it.
fn sleep_timeout_ms(now: Instant, deadline: Instant) -> i32 {
    if now >= deadline {
        return 0;
    }
    let ns = (deadline - now).as_nanos();
    ns.div_ceil(1_000_000).min(i32::MAX as u128) as i32
}

// Exponentially longer bursts of the cpu pause hint, capped.
fn pause(rounds: u32) {
    let spins = 1u32 << rounds.min(6);
    for _ in 0..spins {
        std::hint::spin_loop();
    }
}
