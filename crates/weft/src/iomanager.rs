//! I/O scheduler: worker pool + reactor + timers under one idle loop
//!
//! [`IoManager`] extends the scheduler with readiness events and timers.
//! Each worker's idle fiber blocks in `epoll_wait`, bounded by the next
//! timer deadline (capped at 3 s); wake-ups come from fd readiness, timer
//! expiry, or a byte written to the self-pipe by [`tickle`](Driver::tickle)
//! when new work arrives while workers are parked.
//!
//! Per fd, at most one waiter per direction may be armed at a time
//! (`add_event` asserts this). Firing a slot hands its fiber or callback
//! to the slot's scheduler and clears the slot; re-arming is the woken
//! waiter's business.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use weft_core::{FiberState, IoEvent, Result};

use crate::fiber::Fiber;
use crate::reactor::{errno, event_buffer, PolledEvent, Poller};
use crate::scheduler::{Driver, Scheduler, Task};
use crate::timer::{now_ms, TimerHandle, TimerSet};

/// Registration tag of the self-pipe read end. Fd contexts are tagged with
/// their (never-null) address, so zero is free as a sentinel.
const TICKLE_TOKEN: u64 = 0;

/// Largest readiness batch taken from one poll.
const MAX_EVENTS: usize = 256;

/// Upper bound on one idle poll, so a worker re-checks the stop condition
/// even with no timers armed.
const MAX_POLL_MS: u64 = 3000;

thread_local! {
    /// The io manager whose worker this thread is (if any).
    static CURRENT_IOM: RefCell<Weak<Scheduler<IoDriver>>> = RefCell::new(Weak::new());
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Waiter for one (fd, direction): the scheduler to wake through, and
/// exactly one of fiber / callback.
struct EventSlot {
    scheduler: Weak<Scheduler<IoDriver>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Callback>,
}

impl EventSlot {
    fn empty() -> EventSlot {
        EventSlot {
            scheduler: Weak::new(),
            fiber: None,
            cb: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }
}

struct FdInner {
    /// Directions currently armed in the reactor for this fd.
    events: IoEvent,
    read: EventSlot,
    write: EventSlot,
}

impl FdInner {
    fn slot_mut(&mut self, event: IoEvent) -> &mut EventSlot {
        match event {
            IoEvent::READ => &mut self.read,
            IoEvent::WRITE => &mut self.write,
            other => unreachable!("slot for {:?}", other),
        }
    }
}

/// Per-fd registration state. Lives in the io manager's dense table; its
/// address is the reactor registration tag.
pub(crate) struct FdContext {
    fd: libc::c_int,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: usize) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd: fd as libc::c_int,
            inner: Mutex::new(FdInner {
                events: IoEvent::NONE,
                read: EventSlot::empty(),
                write: EventSlot::empty(),
            }),
        })
    }

    /// Fire the slot of `event` once: disarm the bit and hand the waiter to
    /// its scheduler. Caller holds the fd lock and owns the pending-count
    /// decrement.
    fn trigger(&self, inner: &mut FdInner, event: IoEvent) {
        assert!(
            inner.events.contains(event),
            "trigger: fd={} event {} not armed (armed={})",
            self.fd,
            event,
            inner.events
        );
        inner.events = inner.events.without(event);

        let slot = inner.slot_mut(event);
        let sched = slot.scheduler.upgrade();
        let fiber = slot.fiber.take();
        let cb = slot.cb.take();
        slot.scheduler = Weak::new();

        let Some(sched) = sched else {
            log::warn!("fd={} {} waiter dropped: scheduler is gone", self.fd, event);
            return;
        };
        let task = match cb {
            Some(cb) => Task::call(cb),
            None => Task::fiber(fiber.expect("populated slot with no fiber or callback")),
        };
        if let Err(e) = sched.schedule(task) {
            log::error!("fd={} {} wake failed: {}", self.fd, event, e);
        }
    }
}

/// Reactor-and-timer driver plugged into [`Scheduler`].
pub struct IoDriver {
    poller: Poller,
    /// Self-pipe; [1] written by tickle, [0] armed for READ permanently.
    tickle_fds: [libc::c_int; 2],
    /// Number of populated event slots across all fds.
    pending: AtomicUsize,
    /// Dense fd-indexed table, grown 1.5x on demand, never shrunk.
    contexts: RwLock<Vec<Arc<FdContext>>>,
    timers: TimerSet,
}

impl IoDriver {
    fn new() -> IoDriver {
        let poller = Poller::new().expect("failed to create reactor");

        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0, "failed to create tickle pipe");
        poller
            .arm(fds[0], IoEvent::READ, TICKLE_TOKEN)
            .expect("failed to register tickle pipe");

        let driver = IoDriver {
            poller,
            tickle_fds: fds,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
            timers: TimerSet::new(),
        };
        driver.grow_contexts(32);
        driver
    }

    fn grow_contexts(&self, len: usize) {
        let mut v = self.contexts.write().unwrap();
        let mut fd = v.len();
        let target = len.max(fd);
        v.resize_with(target, || {
            let ctx = FdContext::new(fd);
            fd += 1;
            ctx
        });
    }

    /// Context for `fd`, growing the table if needed.
    fn context_for(&self, fd: usize) -> Arc<FdContext> {
        {
            let v = self.contexts.read().unwrap();
            if fd < v.len() {
                return v[fd].clone();
            }
        }
        self.grow_contexts((fd + 1) * 3 / 2);
        self.contexts.read().unwrap()[fd].clone()
    }

    /// Context for `fd` only if the table already covers it.
    fn existing_context(&self, fd: usize) -> Option<Arc<FdContext>> {
        let v = self.contexts.read().unwrap();
        v.get(fd).cloned()
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// One round of the unified idle loop. Returns true when the worker
    /// should leave idle for good.
    fn idle_round(sched: &Arc<Scheduler<IoDriver>>, events: &mut [libc::epoll_event]) -> bool {
        let d = sched.driver();
        if sched.is_stopping() {
            log::info!("scheduler {}: idle stopping exit", sched.name());
            return true;
        }

        let timeout = d
            .timers
            .next_timeout()
            .unwrap_or(MAX_POLL_MS)
            .min(MAX_POLL_MS);
        let n = match d.poller.poll(timeout, events) {
            Ok(n) => n,
            Err(e) => {
                // Transient; logged by the poller, retried next round.
                log::error!("scheduler {}: poll failed: {}", sched.name(), e);
                0
            }
        };

        let expired = d.timers.expire(now_ms());
        if !expired.is_empty() {
            log::trace!("{} timers expired", expired.len());
            let batch = expired.into_iter().map(|cb| Task::call(move || cb()));
            if let Err(e) = sched.schedule_batch(batch) {
                log::error!("scheduler {}: timer batch dropped: {}", sched.name(), e);
            }
        }

        for raw in events.iter().take(n) {
            let ev = PolledEvent::from(raw);
            if ev.data == TICKLE_TOKEN {
                d.drain_tickle_pipe();
                continue;
            }

            // The tag is the address of an FdContext kept alive by the
            // table, which never shrinks.
            let ctx = unsafe { &*(ev.data as *const FdContext) };
            let mut inner = ctx.inner.lock().unwrap();

            // Error/hangup wakes every armed direction, or a waiter could
            // sleep forever on an fd that will never be ready.
            let mut effective = ev.events();
            if ev.has_error() {
                effective |= (IoEvent::READ | IoEvent::WRITE).intersection(inner.events);
            }
            let hit = effective.intersection(inner.events);
            if hit.is_empty() {
                continue;
            }

            let remain = inner.events.without(hit);
            let rearmed = if remain.is_empty() {
                d.poller.disarm(ctx.fd)
            } else {
                d.poller.rearm(ctx.fd, remain, ev.data)
            };
            if let Err(e) = rearmed {
                log::error!("fd={} rearm after wake failed: {}", ctx.fd, e);
                continue;
            }

            if hit.contains(IoEvent::READ) {
                ctx.trigger(&mut inner, IoEvent::READ);
                d.pending.fetch_sub(1, Ordering::SeqCst);
            }
            if hit.contains(IoEvent::WRITE) {
                ctx.trigger(&mut inner, IoEvent::WRITE);
                d.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        false
    }
}

impl Drop for IoDriver {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl Driver for IoDriver {
    fn on_worker_start(&self, sched: &Arc<Scheduler<Self>>) {
        CURRENT_IOM.with(|c| *c.borrow_mut() = Arc::downgrade(sched));
    }

    /// Wake one parked worker by writing a byte into the self-pipe. No-op
    /// when nobody is parked; a full pipe means a wake-up is already
    /// pending.
    fn tickle(&self, sched: &Scheduler<Self>) {
        if !sched.has_idle_threads() {
            return;
        }
        let n = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        if n != 1 && errno() != libc::EAGAIN {
            log::error!("tickle write failed: errno {}", errno());
        }
    }

    fn stopping(&self, sched: &Scheduler<Self>) -> bool {
        self.timers.is_empty() && self.pending.load(Ordering::SeqCst) == 0 && sched.base_stopping()
    }

    fn idle(sched: Weak<Scheduler<Self>>) {
        log::debug!("io idle");
        let mut events = event_buffer(MAX_EVENTS);
        loop {
            {
                let Some(sched) = sched.upgrade() else { break };
                if IoDriver::idle_round(&sched, &mut events) {
                    break;
                }
            }
            Fiber::yield_hold();
        }
    }
}

impl Scheduler<IoDriver> {
    /// Register interest in `event` on `fd`, capturing the currently
    /// running fiber as the waiter. The fiber is re-scheduled on readiness
    /// (or when the event is cancelled); it must yield to hold after this
    /// call returns.
    ///
    /// Arming an already-armed direction is a programming error and
    /// asserts. On reactor failure nothing is armed and the slot is left
    /// untouched.
    pub fn add_event(&self, fd: libc::c_int, event: IoEvent) -> Result<()> {
        self.add_event_inner(fd, event, None)
    }

    /// Like [`add_event`](Self::add_event), with an explicit callback as
    /// the waiter instead of the current fiber.
    pub fn add_event_cb<F>(&self, fd: libc::c_int, event: IoEvent, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, Some(Box::new(cb)))
    }

    fn add_event_inner(&self, fd: libc::c_int, event: IoEvent, cb: Option<Callback>) -> Result<()> {
        assert!(fd >= 0, "add_event on negative fd");
        assert!(
            event == IoEvent::READ || event == IoEvent::WRITE,
            "add_event takes exactly one direction, got {}",
            event
        );

        let d = self.driver();
        let ctx = d.context_for(fd as usize);
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events.contains(event) {
            log::error!(
                "add_event: fd={} event={} already armed (armed={})",
                fd,
                event,
                inner.events
            );
            panic!("add_event: duplicate waiter for fd={} {}", fd, event);
        }

        let union = inner.events | event;
        let data = Arc::as_ptr(&ctx) as u64;
        if inner.events.is_empty() {
            d.poller.arm(fd, union, data)?;
        } else {
            d.poller.rearm(fd, union, data)?;
        }

        inner.events = union;
        d.pending.fetch_add(1, Ordering::SeqCst);

        let slot = inner.slot_mut(event);
        assert!(slot.is_empty(), "armed bit clear but slot populated");
        slot.scheduler = self.self_weak();
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let cur = Fiber::current()
                    .expect("add_event without a callback must run inside a fiber");
                assert_eq!(
                    cur.state(),
                    FiberState::Exec,
                    "captured waiter fiber not executing"
                );
                slot.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Remove an armed event without waking its waiter. Returns false if
    /// the event was not armed.
    pub fn del_event(&self, fd: libc::c_int, event: IoEvent) -> bool {
        let d = self.driver();
        let Some(ctx) = d.existing_context(fd as usize) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let remain = inner.events.without(event);
        let data = Arc::as_ptr(&ctx) as u64;
        let rc = if remain.is_empty() {
            d.poller.disarm(fd)
        } else {
            d.poller.rearm(fd, remain, data)
        };
        if rc.is_err() {
            return false;
        }

        inner.events = remain;
        let slot = inner.slot_mut(event);
        slot.scheduler = Weak::new();
        slot.fiber = None;
        slot.cb = None;
        d.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Remove an armed event and wake its waiter exactly once. This is the
    /// cancellation wake-path used by timeouts and close.
    pub fn cancel_event(&self, fd: libc::c_int, event: IoEvent) -> bool {
        let d = self.driver();
        let Some(ctx) = d.existing_context(fd as usize) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let remain = inner.events.without(event);
        let data = Arc::as_ptr(&ctx) as u64;
        let rc = if remain.is_empty() {
            d.poller.disarm(fd)
        } else {
            d.poller.rearm(fd, remain, data)
        };
        if rc.is_err() {
            return false;
        }

        ctx.trigger(&mut inner, event);
        d.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancel every armed event on `fd`, waking each waiter once, and
    /// drop the reactor registration.
    pub fn cancel_all(&self, fd: libc::c_int) -> bool {
        let d = self.driver();
        let Some(ctx) = d.existing_context(fd as usize) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        if d.poller.disarm(fd).is_err() {
            return false;
        }

        if inner.events.contains(IoEvent::READ) {
            ctx.trigger(&mut inner, IoEvent::READ);
            d.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.contains(IoEvent::WRITE) {
            ctx.trigger(&mut inner, IoEvent::WRITE);
            d.pending.fetch_sub(1, Ordering::SeqCst);
        }
        assert!(inner.events.is_empty());
        true
    }

    /// One-shot or recurring timer; the callback is scheduled as a task on
    /// expiry.
    pub fn add_timer<F>(&self, delay_ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (handle, at_front) = self.driver().timers.add_timer(delay_ms, cb, recurring);
        if at_front {
            // The idle poll may now be waiting too long; wake it so it
            // recomputes its deadline.
            self.driver().tickle(self);
        }
        handle
    }

    /// Timer gated on a weak witness; see [`TimerSet::add_condition_timer`].
    pub fn add_condition_timer<F, T>(&self, delay_ms: u64, cb: F, witness: &Arc<T>) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let (handle, at_front) = self
            .driver()
            .timers
            .add_condition_timer(delay_ms, cb, witness);
        if at_front {
            self.driver().tickle(self);
        }
        handle
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) -> bool {
        self.driver().timers.cancel(handle)
    }

    pub fn reset_timer(&self, handle: &TimerHandle, delay_ms: u64, from_now: bool) -> bool {
        let (found, at_front) = self.driver().timers.reset(handle, delay_ms, from_now);
        if at_front {
            self.driver().tickle(self);
        }
        found
    }

    /// Number of populated event slots (armed waiters) across all fds.
    pub fn pending_event_count(&self) -> usize {
        self.driver().pending.load(Ordering::SeqCst)
    }
}

/// Cloneable handle to an I/O scheduler.
///
/// Derefs to [`Scheduler<IoDriver>`], so `schedule`, `stop`, `add_event`,
/// `add_timer` and friends are all called directly on the handle.
#[derive(Clone)]
pub struct IoManager {
    sched: Arc<Scheduler<IoDriver>>,
}

impl IoManager {
    /// Build and start an I/O scheduler. `threads` counts the caller when
    /// `use_caller` is set, in which case `stop` must later be called on
    /// this same thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> IoManager {
        let sched = Scheduler::with_driver(threads, use_caller, name, IoDriver::new());
        if use_caller {
            CURRENT_IOM.with(|c| *c.borrow_mut() = Arc::downgrade(&sched));
        }
        sched.start();
        IoManager { sched }
    }

    /// The io manager owning the calling thread, if the thread is one of
    /// its workers (or constructed it with `use_caller`).
    pub fn current() -> Option<IoManager> {
        CURRENT_IOM
            .with(|c| c.borrow().upgrade())
            .map(|sched| IoManager { sched })
    }
}

impl std::ops::Deref for IoManager {
    type Target = Scheduler<IoDriver>;

    fn deref(&self) -> &Scheduler<IoDriver> {
        &self.sched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_count_add_del() {
        let iom = IoManager::new(1, false, "t-iom-adddel");
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);

        iom.add_event_cb(fds[0], IoEvent::READ, || {}).unwrap();
        assert_eq!(iom.pending_event_count(), 1);

        assert!(iom.del_event(fds[0], IoEvent::READ));
        assert_eq!(iom.pending_event_count(), 0);
        assert!(!iom.del_event(fds[0], IoEvent::READ));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        iom.stop();
    }

    #[test]
    fn test_cancel_event_wakes_once() {
        let iom = IoManager::new(1, false, "t-iom-cancel");
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event_cb(fds[0], IoEvent::READ, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(iom.cancel_event(fds[0], IoEvent::READ));
        assert_eq!(iom.pending_event_count(), 0);
        // A second cancel finds nothing.
        assert!(!iom.cancel_event(fds[0], IoEvent::READ));

        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1, "cancel wakes exactly once");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_readiness_fires_callback() {
        let iom = IoManager::new(1, false, "t-iom-ready");
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event_cb(fds[0], IoEvent::READ, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(
            unsafe { libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "waiter never woke");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
