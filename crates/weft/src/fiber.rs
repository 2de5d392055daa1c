//! Stackful fibers
//!
//! A [`Fiber`] is a cooperatively scheduled execution context with its own
//! stack. Fibers are non-symmetric: a fiber yields only to its peer — the
//! thread's scheduling fiber by default, or the thread's root fiber for the
//! scheduler's own caller-mode fiber ([`Peer`]).
//!
//! State machine: `Init` → `Exec` (first resume) → `Hold`/`Ready` on yield,
//! `Term`/`Except` on return/panic. A terminal fiber can only run again
//! after [`Fiber::reset`]. Resuming a terminal fiber is a programming error
//! and asserts.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use weft_core::{FiberId, FiberState};

use crate::current_arch::{context_switch, init_context, Context};
use crate::stack::Stack;
use crate::{config, tls};

/// Live fiber count, root fibers included.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of fibers currently alive in the process.
pub fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Where a fiber swaps back to when it yields or terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// The thread's scheduling fiber (the default for worker fibers)
    Sched,
    /// The thread's root fiber (used by a scheduler's caller-mode
    /// scheduling fiber, which must hand the original stack back on stop)
    Root,
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// A stackful cooperative execution context.
///
/// Handles are `Arc<Fiber>`; the object is shared between the scheduler
/// queue, event slots, and the trampoline. The state machine guarantees at
/// most one thread executes a given fiber at a time, which is what makes
/// the interior `UnsafeCell` access sound.
pub struct Fiber {
    id: FiberId,
    /// None for root fibers, which run on the thread's original stack.
    stack: Option<Stack>,
    ctx: UnsafeCell<Context>,
    /// Single-shot entry closure, consumed on first entry.
    entry: UnsafeCell<Option<EntryFn>>,
    state: AtomicU8,
    peer: Peer,
}

// Safety: `ctx` and `entry` are only touched by the thread that holds the
// fiber in Exec (or by resume/reset, which the state machine serializes);
// `state` is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Spawn a fiber with the configured default stack size, yielding back
    /// to the scheduling fiber.
    pub fn new<F>(entry: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_options(entry, 0, Peer::Sched)
    }

    /// Spawn a fiber with an explicit stack size (0 = configured default)
    /// and yield-back peer.
    pub fn with_options<F>(entry: F, stack_size: usize, peer: Peer) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_boxed(Box::new(entry), stack_size, peer)
    }

    pub(crate) fn from_boxed(entry: EntryFn, stack_size: usize, peer: Peer) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::stack_size()
        } else {
            stack_size
        };
        let stack = Stack::new(size).expect("fiber stack allocation failed");

        let fiber = Arc::new(Fiber {
            id: FiberId::alloc(),
            stack: Some(stack),
            ctx: UnsafeCell::new(Context::default()),
            entry: UnsafeCell::new(Some(entry)),
            state: AtomicU8::new(FiberState::Init as u8),
            peer,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        // The trampoline receives the fiber's address and re-creates a
        // strong handle from it; valid because resume requires the caller
        // to hold one.
        unsafe {
            init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_main,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        log::trace!("fiber {} created", fiber.id);
        fiber
    }

    /// Materialize the calling thread's original context as its root fiber.
    ///
    /// Idempotent. The root fiber is in `Exec` (the thread *is* running it)
    /// and has no owned stack; its context is filled in by the first switch
    /// away from it.
    pub fn ensure_root() -> Arc<Fiber> {
        if let Some(root) = tls::root_fiber() {
            return root;
        }
        let root = Arc::new(Fiber {
            id: FiberId::alloc(),
            stack: None,
            ctx: UnsafeCell::new(Context::default()),
            entry: UnsafeCell::new(None),
            state: AtomicU8::new(FiberState::Exec as u8),
            peer: Peer::Sched,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::trace!("root fiber {} materialized", root.id);
        tls::set_current_fiber(Arc::as_ptr(&root));
        tls::set_root_fiber(root.clone());
        root
    }

    /// The fiber currently executing on this thread, if any.
    pub fn current() -> Option<Arc<Fiber>> {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { clone_arc(ptr) })
        }
    }

    /// Id of the fiber currently executing on this thread, NONE outside
    /// any fiber. Cheap; used in log lines.
    pub fn current_id() -> FiberId {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            FiberId::NONE
        } else {
            unsafe { (*ptr).id }
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switch from the scheduling fiber into this fiber.
    ///
    /// The caller must hold a strong handle for the duration of the call
    /// and must be executing on the thread's scheduling fiber. Returns when
    /// this fiber yields or terminates.
    pub fn resume(&self) {
        let state = self.state();
        assert!(
            state.is_resumable(),
            "resume on fiber {} in state {}",
            self.id,
            state
        );
        let sched = tls::sched_fiber_ptr();
        assert!(!sched.is_null(), "resume without a scheduling fiber");

        tls::set_current_fiber(self as *const Fiber);
        self.set_state(FiberState::Exec);
        unsafe {
            context_switch((*sched).ctx.get(), self.ctx.get());
        }
    }

    /// Switch from the thread's root fiber into this fiber. Caller-mode
    /// counterpart of [`resume`](Self::resume); used to run a scheduler's
    /// caller-mode scheduling fiber on the constructing thread.
    pub fn call(&self) {
        let state = self.state();
        assert!(
            state.is_resumable(),
            "call on fiber {} in state {}",
            self.id,
            state
        );
        let root = tls::root_fiber_ptr();
        assert!(!root.is_null(), "call without a root fiber");

        tls::set_current_fiber(self as *const Fiber);
        self.set_state(FiberState::Exec);
        unsafe {
            context_switch((*root).ctx.get(), self.ctx.get());
        }
    }

    /// Switch from this fiber back to the thread's root fiber. Counterpart
    /// of [`call`](Self::call); does not touch the state, the caller sets
    /// it first.
    pub fn back(&self) {
        let root = tls::root_fiber_ptr();
        assert!(!root.is_null(), "back without a root fiber");
        tls::set_current_fiber(root);
        unsafe {
            context_switch(self.ctx.get(), (*root).ctx.get());
        }
    }

    /// Suspend the current fiber in `Hold`. It is now owned by whoever will
    /// schedule it again (a reactor slot, a timer, or application code).
    pub fn yield_hold() {
        Self::yield_with(FiberState::Hold);
    }

    /// Suspend the current fiber in `Ready`; the scheduler re-enqueues it
    /// immediately.
    pub fn yield_ready() {
        Self::yield_with(FiberState::Ready);
    }

    fn yield_with(state: FiberState) {
        let cur = tls::current_fiber_ptr();
        assert!(!cur.is_null(), "yield outside a fiber");
        let cur = unsafe { &*cur };
        assert_eq!(
            cur.state(),
            FiberState::Exec,
            "yield on fiber {} not in EXEC",
            cur.id
        );
        cur.set_state(state);
        cur.swap_to_sched();
    }

    /// Swap from this fiber to the thread's scheduling fiber.
    fn swap_to_sched(&self) {
        let sched = tls::sched_fiber_ptr();
        assert!(!sched.is_null(), "no scheduling fiber to yield to");
        tls::set_current_fiber(sched);
        unsafe {
            context_switch(self.ctx.get(), (*sched).ctx.get());
        }
    }

    /// Re-aim a finished (or never-started) fiber at a new entry closure,
    /// reusing its stack. State returns to `Init`.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(entry));
    }

    pub(crate) fn reset_boxed(&self, entry: EntryFn) {
        let stack = self.stack.as_ref().expect("reset on a root fiber");
        let state = self.state();
        assert!(
            state.is_resettable(),
            "reset on fiber {} in state {}",
            self.id,
            state
        );
        unsafe {
            *self.entry.get() = Some(entry);
            init_context(
                self.ctx.get(),
                stack.top(),
                fiber_main,
                self as *const Fiber as usize,
            );
        }
        self.set_state(FiberState::Init);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if self.stack.is_some() {
            assert!(
                state.is_resettable(),
                "fiber {} dropped in state {}",
                self.id,
                state
            );
        } else {
            assert_eq!(
                state,
                FiberState::Exec,
                "root fiber {} dropped in state {}",
                self.id,
                state
            );
        }
        log::trace!("fiber {} destroyed, {} alive", self.id, total_fibers());
    }
}

/// Re-create a strong handle from a raw fiber pointer.
///
/// # Safety
///
/// `ptr` must be the data pointer of a live `Arc<Fiber>` (as produced by
/// `Arc::as_ptr`) whose strong count cannot reach zero during this call.
unsafe fn clone_arc(ptr: *const Fiber) -> Arc<Fiber> {
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

/// Entry point every fiber starts in (via the arch trampoline).
///
/// Runs the entry closure under a panic guard, records the terminal state,
/// drops its own strong handle, and swaps to the fiber's peer. The drop
/// before the terminal swap matters: the last remaining handle must be
/// released on some other stack, never on the stack being abandoned.
extern "C" fn fiber_main(arg: usize) -> ! {
    let fiber = unsafe { clone_arc(arg as *const Fiber) };

    let entry = unsafe { (*fiber.entry.get()).take() };
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let entry = entry.expect("fiber entered without an entry closure");
        entry();
    }));
    match result {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(payload) => {
            fiber.set_state(FiberState::Except);
            let msg = panic_message(&payload);
            log::error!("fiber {} panicked: {}", fiber.id, msg);
        }
    }

    let peer = fiber.peer;
    let raw = Arc::as_ptr(&fiber);
    drop(fiber);

    // The resume caller still holds a strong handle until the switch below
    // completes, so `raw` stays valid here.
    unsafe {
        match peer {
            Peer::Sched => (*raw).swap_to_sched(),
            Peer::Root => (*raw).back(),
        }
    }
    unreachable!("terminated fiber resumed");
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Drive fibers directly from the test thread: the root fiber doubles
    /// as the scheduling fiber.
    fn init_thread() -> Arc<Fiber> {
        let root = Fiber::ensure_root();
        tls::set_sched_fiber(Arc::as_ptr(&root));
        root
    }

    #[test]
    fn test_resume_yield_resume() {
        init_thread();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let log2 = log.clone();
        let fiber = Fiber::new(move || {
            log2.lock().unwrap().push("first");
            Fiber::yield_hold();
            log2.lock().unwrap().push("second");
        });

        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Hold);
        assert_eq!(*log.lock().unwrap(), vec!["first"]);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_yield_ready_state() {
        init_thread();
        let fiber = Fiber::new(|| {
            Fiber::yield_ready();
        });
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_panic_sets_except() {
        init_thread();
        let fiber = Fiber::new(|| {
            panic!("boom");
        });
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
    }

    #[test]
    fn test_reset_reuses_stack() {
        init_thread();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_current_inside_fiber() {
        init_thread();
        let seen = Arc::new(Mutex::new(FiberId::NONE));

        let seen2 = seen.clone();
        let fiber = Fiber::new(move || {
            *seen2.lock().unwrap() = Fiber::current().unwrap().id();
        });
        let id = fiber.id();
        fiber.resume();
        assert_eq!(*seen.lock().unwrap(), id);
        // Back on the root fiber now.
        assert_eq!(Fiber::current().unwrap().id(), init_thread().id());
    }

    #[test]
    fn test_nested_spawn_runs_after_yield() {
        init_thread();
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let a = Fiber::new(move || {
            o.lock().unwrap().push(1);
            Fiber::yield_hold();
            o.lock().unwrap().push(3);
        });
        a.resume();
        order.lock().unwrap().push(2);
        a.resume();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }
}
