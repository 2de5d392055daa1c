//! Worker-pool fiber scheduler
//!
//! N worker threads cooperatively multiplex a FIFO queue of tasks (fibers
//! or closures). Each worker runs the scheduling loop on its *scheduling
//! fiber*; resumed fibers yield back to it. With `use_caller` the
//! constructing thread is enrolled as a worker too: its scheduling fiber is
//! a sub-fiber that [`stop`](Scheduler::stop) drives via `call()`, handing
//! the original stack back when the drain completes.
//!
//! The scheduler is generic over a [`Driver`] supplying the idle behaviour,
//! the worker wake-up, and the stop condition. The base [`NullDriver`]
//! busy-yields when idle; the I/O driver in [`crate::iomanager`] blocks in
//! the reactor instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use weft_core::{Error, FiberState, Result};

use crate::fiber::{Fiber, Peer};
use crate::tls;

/// Pin value meaning "runnable on any worker".
pub const ANY_THREAD: libc::pid_t = -1;

enum TaskKind {
    Fiber(Arc<Fiber>),
    Closure(Box<dyn FnOnce() + Send + 'static>),
}

/// A unit of schedulable work: a fiber or a closure, optionally pinned to
/// one worker's kernel thread id.
pub struct Task {
    kind: TaskKind,
    thread: libc::pid_t,
}

impl Task {
    /// Schedule an existing fiber.
    pub fn fiber(f: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(f),
            thread: ANY_THREAD,
        }
    }

    /// Schedule a closure; the worker wraps it in a (recycled) fiber.
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Closure(Box::new(f)),
            thread: ANY_THREAD,
        }
    }

    /// Pin this task to the worker with the given kernel thread id.
    pub fn pinned(mut self, thread: libc::pid_t) -> Task {
        self.thread = thread;
        self
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(f: Arc<Fiber>) -> Task {
        Task::fiber(f)
    }
}

/// Customization seam of the scheduler: how workers idle, how they are
/// woken, and when the whole thing may stop.
pub trait Driver: Sized + Send + Sync + 'static {
    /// Called once per worker before it starts taking tasks.
    fn on_worker_start(&self, _sched: &Arc<Scheduler<Self>>) {}

    /// Wake one worker that may be parked in the idle fiber.
    fn tickle(&self, sched: &Scheduler<Self>);

    /// Body of the per-worker idle fiber. Receives a weak handle so a
    /// suspended idle fiber never keeps the scheduler alive; upgrade per
    /// iteration and return when stopping (or when the scheduler is gone).
    fn idle(sched: Weak<Scheduler<Self>>);

    /// Whether the scheduler may stop. Extend this to also require
    /// driver-owned work (timers, pending events) to be drained.
    fn stopping(&self, sched: &Scheduler<Self>) -> bool {
        sched.base_stopping()
    }
}

/// Base driver: no reactor. Idle busy-yields until the stop condition
/// holds, so no wake-up mechanism is needed.
pub struct NullDriver;

impl Driver for NullDriver {
    fn tickle(&self, sched: &Scheduler<Self>) {
        log::trace!("scheduler {} tickle", sched.name());
    }

    fn idle(sched: Weak<Scheduler<Self>>) {
        log::debug!("idle");
        loop {
            let Some(s) = sched.upgrade() else { break };
            if s.is_stopping() {
                break;
            }
            drop(s);
            Fiber::yield_hold();
        }
    }
}

/// An N-thread fiber scheduler. See the module docs.
pub struct Scheduler<D: Driver = NullDriver> {
    name: String,
    self_ref: Weak<Scheduler<D>>,
    driver: D,

    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Worker threads to spawn (the caller, when enrolled, is not counted).
    thread_count: usize,

    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,

    started: AtomicBool,
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
    stopped: AtomicBool,

    /// Kernel tid of the enrolled caller thread, or -1.
    root_thread: libc::pid_t,
    /// Caller-mode scheduling fiber (use_caller only).
    root_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler<NullDriver> {
    /// Create a base scheduler. `threads` counts the caller when
    /// `use_caller` is set. Call [`start`](Self::start) to spawn workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Self> {
        Self::with_driver(threads, use_caller, name, NullDriver)
    }
}

impl<D: Driver> Scheduler<D> {
    /// Create a scheduler around the given driver.
    ///
    /// With `use_caller`, the constructing thread is enrolled as a worker:
    /// its root fiber is materialized and a caller-mode scheduling fiber
    /// bound to the scheduling loop is created; [`stop`](Self::stop) must
    /// later be called on this same thread to drive it.
    pub fn with_driver(threads: usize, use_caller: bool, name: &str, driver: D) -> Arc<Self> {
        assert!(threads > 0, "scheduler needs at least one thread");

        let (thread_count, root_thread) = if use_caller {
            (threads - 1, tls::thread_id())
        } else {
            (threads, ANY_THREAD)
        };

        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler<D>>| {
            let root_fiber = if use_caller {
                Fiber::ensure_root();
                let wk = weak.clone();
                let f = Fiber::with_options(
                    move || {
                        if let Some(s) = wk.upgrade() {
                            s.run();
                        }
                    },
                    0,
                    Peer::Root,
                );
                tls::set_sched_fiber(Arc::as_ptr(&f));
                Some(f)
            } else {
                None
            };

            Scheduler {
                name: name.to_string(),
                self_ref: weak.clone(),
                driver,
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_count,
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                auto_stop: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                root_thread,
                root_fiber: Mutex::new(root_fiber),
            }
        });
        log::debug!(
            "scheduler {} created: {} workers, use_caller={}",
            sched.name,
            sched.thread_count,
            use_caller
        );
        sched
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn driver(&self) -> &D {
        &self.driver
    }

    /// Weak handle to this scheduler; upgradable while any strong handle
    /// lives. Used by event slots, which must not keep the scheduler alive.
    pub(crate) fn self_weak(&self) -> Weak<Scheduler<D>> {
        self.self_ref.clone()
    }

    /// Kernel tid of the enrolled caller thread, or -1.
    #[inline]
    pub fn root_thread(&self) -> libc::pid_t {
        self.root_thread
    }

    #[inline]
    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) {
        if self.stopped.load(Ordering::Acquire) {
            log::warn!("scheduler {}: start after stop ignored", self.name);
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.thread_count {
            let me = self
                .self_ref
                .upgrade()
                .expect("scheduler dropped during start");
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || me.run())
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        log::debug!("scheduler {} started", self.name);
    }

    /// Enqueue a task. Safe from any thread, including from inside fibers
    /// and from reactor callbacks. Fails only after the scheduler has
    /// fully stopped.
    pub fn schedule(&self, task: impl Into<Task>) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        self.enqueue(task.into());
        Ok(())
    }

    /// Enqueue many tasks under one queue lock, with a single wake-up.
    pub fn schedule_batch<I>(&self, tasks: I) -> Result<()>
    where
        I: IntoIterator<Item = Task>,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let mut added = false;
        {
            let mut q = self.queue.lock().unwrap();
            for t in tasks {
                q.push_back(t);
                added = true;
            }
        }
        if added {
            self.driver.tickle(self);
        }
        Ok(())
    }

    /// Internal enqueue without the stopped check; used by the run loop to
    /// requeue fibers it already owns.
    fn enqueue(&self, task: Task) {
        let was_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if was_empty {
            self.driver.tickle(self);
        }
    }

    /// Base stop condition: stop requested, queue drained, nobody active.
    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stop_requested.load(Ordering::Acquire)
            && self.queue.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Full stop condition including driver-owned work.
    pub(crate) fn is_stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    /// Request a stop and drain.
    ///
    /// Wakes every worker, runs the caller-mode scheduling fiber to
    /// completion when the caller is enrolled (must then be invoked on the
    /// constructing thread), and joins the workers. Idempotent; after it
    /// returns, `schedule` yields `Err(Stopped)`.
    pub fn stop(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.auto_stop.store(true, Ordering::Release);

        // Caller-only scheduler whose scheduling fiber never ran (or
        // already finished): nothing to drain.
        if self.thread_count == 0 {
            if let Some(root) = self.root_fiber.lock().unwrap().clone() {
                let st = root.state();
                if st == FiberState::Term || st == FiberState::Init {
                    self.stop_requested.store(true, Ordering::Release);
                    if self.is_stopping() {
                        self.stopped.store(true, Ordering::Release);
                        log::info!("scheduler {} stopped", self.name);
                        return;
                    }
                }
            }
        }

        self.stop_requested.store(true, Ordering::Release);
        for _ in 0..self.thread_count {
            self.driver.tickle(self);
        }

        let root = self.root_fiber.lock().unwrap().clone();
        if let Some(root) = root {
            // The enrolled caller participates in the drain too.
            self.driver.tickle(self);
            if !self.is_stopping() {
                root.call();
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
        self.stopped.store(true, Ordering::Release);
        log::info!("scheduler {} stopped", self.name);
    }

    /// Per-worker loop. Runs on the worker's scheduling fiber.
    fn run(self: Arc<Self>) {
        log::debug!("scheduler {} run on thread {}", self.name, tls::thread_id());
        crate::hook::set_hook_enabled(true);

        if tls::thread_id() != self.root_thread {
            // A spawned worker's original context doubles as its
            // scheduling fiber. The caller-mode fiber was wired up in the
            // constructor instead.
            let root = Fiber::ensure_root();
            tls::set_sched_fiber(Arc::as_ptr(&root));
        }
        self.driver.on_worker_start(&self);

        let weak = self.self_ref.clone();
        let idle_fiber = Fiber::new(move || D::idle(weak));
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let (task, tickle_me) = self.take_task();
            if tickle_me {
                self.driver.tickle(&self);
            }

            match task {
                Some(Task {
                    kind: TaskKind::Fiber(f),
                    ..
                }) => {
                    if f.state().is_terminal() {
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    f.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        FiberState::Ready => self.enqueue(Task::fiber(f)),
                        s if !s.is_terminal() => f.set_state(FiberState::Hold),
                        _ => {}
                    }
                }
                Some(Task {
                    kind: TaskKind::Closure(cb),
                    ..
                }) => {
                    // Reuse one fiber per worker for closure tasks.
                    let fiber = match cb_fiber.take() {
                        Some(f) => {
                            f.reset_boxed(cb);
                            f
                        }
                        None => Fiber::from_boxed(cb, 0, Peer::Sched),
                    };
                    fiber.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.enqueue(Task::fiber(fiber)),
                        s if s.is_terminal() => cb_fiber = Some(fiber),
                        _ => fiber.set_state(FiberState::Hold),
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        log::debug!("scheduler {}: idle fiber terminated", self.name);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                    if !idle_fiber.state().is_terminal() {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                }
            }
        }
        log::debug!("scheduler {}: worker {} exits", self.name, tls::thread_id());
    }

    /// Pop the first task this worker may run. Honors pinning, skips
    /// fibers that are still executing elsewhere, and reports whether
    /// another worker should be woken (work was skipped or remains).
    fn take_task(&self) -> (Option<Task>, bool) {
        let tid = tls::thread_id();
        let mut q = self.queue.lock().unwrap();

        let mut skipped = false;
        let mut found = None;
        for (i, t) in q.iter().enumerate() {
            if t.thread != ANY_THREAD && t.thread != tid {
                skipped = true;
                continue;
            }
            if let TaskKind::Fiber(f) = &t.kind {
                if f.state() == FiberState::Exec {
                    continue;
                }
            }
            found = Some(i);
            break;
        }

        match found {
            Some(i) => {
                let task = q.remove(i);
                self.active_threads.fetch_add(1, Ordering::SeqCst);
                let more = !q.is_empty();
                (task, skipped || more)
            }
            None => (None, skipped),
        }
    }
}

impl<D: Driver> Drop for Scheduler<D> {
    fn drop(&mut self) {
        self.stop();
    }
}
