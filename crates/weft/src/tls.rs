//! Thread-local anchor for fiber context
//!
//! Each thread tracks three fibers:
//! - the fiber currently executing (raw pointer, updated by every swap),
//! - the thread's root fiber (the original OS-thread context, held
//!   strongly for the thread's lifetime once materialized),
//! - the scheduling fiber (the fiber running the scheduler loop; the peer
//!   of every worker-fiber yield).
//!
//! Raw pointers here are always backed by a strong reference elsewhere:
//! the root slot below, a scheduler's caller-mode scheduling fiber, or the
//! resume caller's local handle.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::fiber::Fiber;

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// This thread's root fiber (original OS-thread context)
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's scheduling fiber
    static SCHED_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Cached kernel thread id
    static THREAD_ID: Cell<libc::pid_t> = const { Cell::new(-1) };
}

/// Set the currently executing fiber. Called by the side performing a
/// context swap, never by the fiber being swapped out.
#[inline]
pub(crate) fn set_current_fiber(f: *const Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(f));
}

/// Raw pointer to the currently executing fiber (null outside any fiber).
#[inline]
pub(crate) fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

/// Store this thread's root fiber.
pub(crate) fn set_root_fiber(f: Arc<Fiber>) {
    ROOT_FIBER.with(|slot| *slot.borrow_mut() = Some(f));
}

/// This thread's root fiber, if materialized.
pub(crate) fn root_fiber() -> Option<Arc<Fiber>> {
    ROOT_FIBER.with(|slot| slot.borrow().clone())
}

/// Raw pointer to this thread's root fiber (null if not materialized).
/// Used on swap paths that must not touch reference counts.
#[inline]
pub(crate) fn root_fiber_ptr() -> *const Fiber {
    ROOT_FIBER.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |f| Arc::as_ptr(f))
    })
}

/// Set this thread's scheduling fiber.
#[inline]
pub(crate) fn set_sched_fiber(f: *const Fiber) {
    SCHED_FIBER.with(|cell| cell.set(f));
}

/// Raw pointer to this thread's scheduling fiber (null before a scheduler
/// has claimed the thread).
#[inline]
pub(crate) fn sched_fiber_ptr() -> *const Fiber {
    SCHED_FIBER.with(|cell| cell.get())
}

/// Kernel thread id of the calling thread, cached after the first call.
#[inline]
pub fn thread_id() -> libc::pid_t {
    THREAD_ID.with(|cell| {
        let mut tid = cell.get();
        if tid == -1 {
            tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            cell.set(tid);
        }
        tid
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable() {
        let a = thread_id();
        let b = thread_id();
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn test_thread_id_differs_across_threads() {
        let here = thread_id();
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
