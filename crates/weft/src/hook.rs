//! Blocking-style syscall wrappers
//!
//! Drop-in replacements for the blocking socket and sleep calls. On a
//! scheduler worker (where the per-thread hook flag is on), a call that
//! would block parks the current fiber on the io manager instead of the
//! thread: the raw nonblocking syscall is tried, `EAGAIN` arms a readiness
//! event (plus a condition timer when the fd carries a `SO_RCVTIMEO` /
//! `SO_SNDTIMEO`), the fiber yields, and on wake-up the call retries.
//!
//! Observable behaviour matches the raw syscalls byte for byte — same
//! return values, same errno — for non-socket fds, for sockets the
//! application itself made nonblocking, and whenever the hook is off. For
//! hooked sockets the result matches the *blocking* syscall, except that
//! `EAGAIN` never escapes and `ETIMEDOUT` is produced when a per-fd
//! timeout expires. That is the only errno this layer invents.
//!
//! The raw syscall always stays reachable: pass-through is a direct
//! `libc` call.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
    timeval,
};

use weft_core::{Error, IoEvent};

use crate::config;
use crate::fdtable::fd_table;
use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::reactor::errno;
use crate::scheduler::Task;

thread_local! {
    /// Hook switch; off everywhere except scheduler workers, which turn it
    /// on before taking their first task.
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether hooked calls on this thread cooperate with the runtime.
#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Toggle the hook for the calling thread.
#[inline]
pub fn set_hook_enabled(flag: bool) {
    HOOK_ENABLED.with(|c| c.set(flag));
}

#[inline]
fn set_errno(v: c_int) {
    unsafe {
        *libc::__errno_location() = v;
    }
}

/// Shared between a parked waiter and its timeout timer, so the waiter can
/// tell on resume whether it woke by readiness or by cancellation. Holds 0
/// or the errno the waiter must report.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The async-wrap shared by every hooked I/O call.
///
/// `raw` performs the underlying nonblocking syscall and may be invoked
/// several times (initial try, retry after `EINTR`, retry after wake).
fn do_io<F>(fd: c_int, name: &str, event: IoEvent, timeout_kind: c_int, raw: F) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !is_hook_enabled() {
        return raw();
    }
    let Some(meta) = fd_table().get(fd, true) else {
        return raw();
    };
    if meta.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return raw();
    }

    let timeout_ms = meta.timeout_ms(timeout_kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: park this fiber on the reactor.
        let Some(iom) = IoManager::current() else {
            log::error!("{}: hook enabled but no io manager on this thread", name);
            return n;
        };

        let timer = if timeout_ms != -1 {
            let winfo = Arc::downgrade(&tinfo);
            let wsched = iom.self_weak();
            Some(iom.add_condition_timer(
                timeout_ms as u64,
                move || {
                    let Some(t) = winfo.upgrade() else { return };
                    if t.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    if let Some(s) = wsched.upgrade() {
                        s.cancel_event(fd, event);
                    }
                },
                &tinfo,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, event) {
            log::error!("{}: add_event(fd={}, {}) failed: {}", name, fd, event, e);
            if let Some(t) = &timer {
                iom.cancel_timer(t);
            }
            if let Error::Reactor(err) = e {
                set_errno(err);
            }
            return -1;
        }

        // Woken either by readiness or by the timer's cancel_event.
        Fiber::yield_hold();

        if let Some(t) = &timer {
            iom.cancel_timer(t);
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Readiness: retry the raw call.
    }
}

// ── sleep family ──────────────────────────────────────────────────────

/// Hooked `sleep(3)`: parks the fiber on a timer instead of the thread.
pub fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

/// Hooked `usleep(3)`.
pub fn usleep(usec: c_uint) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(usec as u64 / 1000);
    0
}

/// Hooked `nanosleep(2)`. The remainder argument is never written: a
/// hooked sleep is not interruptible by signals.
///
/// # Safety
///
/// `req` must point to a valid `timespec`.
pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !is_hook_enabled() {
        return libc::nanosleep(req, rem);
    }
    let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

fn sleep_ms(ms: u64) {
    let (Some(fiber), Some(iom)) = (Fiber::current(), IoManager::current()) else {
        log::error!("hooked sleep outside a fiber context");
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };
    let wsched = iom.self_weak();
    iom.add_timer(
        ms,
        move || {
            if let Some(s) = wsched.upgrade() {
                if let Err(e) = s.schedule(Task::fiber(fiber.clone())) {
                    log::error!("sleep wake failed: {}", e);
                }
            }
        },
        false,
    );
    Fiber::yield_hold();
}

// ── socket lifecycle ──────────────────────────────────────────────────

/// Hooked `socket(2)`: registers the new fd, forcing kernel nonblock.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 {
        fd_table().get(fd, true);
    }
    fd
}

/// Hooked `accept(2)`: parks until a connection arrives, then registers
/// the accepted fd.
///
/// # Safety
///
/// `addr`/`addrlen` must be null or valid, as for the raw syscall.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let new_fd = do_io(fd, "accept", IoEvent::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::accept(fd, addr, addrlen) as ssize_t
    }) as c_int;
    if new_fd >= 0 && is_hook_enabled() {
        fd_table().get(new_fd, true);
    }
    new_fd
}

/// Hooked `connect(2)` with an explicit timeout (-1 = none).
///
/// On timeout returns -1/`ETIMEDOUT` with the fd left open; otherwise the
/// pending connect is resolved through `SO_ERROR`, exactly like a blocking
/// connect.
///
/// # Safety
///
/// `addr` must point to a valid address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: i64,
) -> c_int {
    if !is_hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(meta) = fd_table().get(fd, true) else {
        return libc::connect(fd, addr, addrlen);
    };
    if meta.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        log::error!("connect: hook enabled but no io manager on this thread");
        return n;
    };

    let tinfo = Arc::new(TimerInfo::default());
    let timer = if timeout_ms != -1 {
        let winfo = Arc::downgrade(&tinfo);
        let wsched = iom.self_weak();
        Some(iom.add_condition_timer(
            timeout_ms as u64,
            move || {
                let Some(t) = winfo.upgrade() else { return };
                if t.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(s) = wsched.upgrade() {
                    s.cancel_event(fd, IoEvent::WRITE);
                }
            },
            &tinfo,
        ))
    } else {
        None
    };

    match iom.add_event(fd, IoEvent::WRITE) {
        Ok(()) => {
            // Local connect completion or the timer's cancel wakes us.
            Fiber::yield_hold();
            if let Some(t) = &timer {
                iom.cancel_timer(t);
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                iom.cancel_timer(t);
            }
            log::error!("connect: add_event(fd={}, WRITE) failed: {}", fd, e);
        }
    }

    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// Hooked `connect(2)` using the configured default timeout
/// (`tcp.connect.timeout`).
///
/// # Safety
///
/// `addr` must point to a valid address of length `addrlen`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, config::connect_timeout_ms())
}

/// Hooked `close(2)`: wakes every parked waiter on the fd (they observe
/// `EBADF` on retry), forgets its metadata, then closes.
pub fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if let Some(meta) = fd_table().get(fd, false) {
        meta.set_closed();
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_table().del(fd);
    }
    unsafe { libc::close(fd) }
}

// ── read family ───────────────────────────────────────────────────────

/// Hooked `read(2)`.
///
/// # Safety
///
/// `buf` must be valid for `count` writable bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", IoEvent::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::read(fd, buf, count)
    })
}

/// Hooked `readv(2)`.
///
/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", IoEvent::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

/// Hooked `recv(2)`.
///
/// # Safety
///
/// `buf` must be valid for `len` writable bytes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", IoEvent::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::recv(fd, buf, len, flags)
    })
}

/// Hooked `recvfrom(2)`.
///
/// # Safety
///
/// Pointer arguments as for the raw syscall.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", IoEvent::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// Hooked `recvmsg(2)`.
///
/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", IoEvent::READ, libc::SO_RCVTIMEO, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── write family ──────────────────────────────────────────────────────

/// Hooked `write(2)`.
///
/// # Safety
///
/// `buf` must be valid for `count` readable bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", IoEvent::WRITE, libc::SO_SNDTIMEO, || unsafe {
        libc::write(fd, buf, count)
    })
}

/// Hooked `writev(2)`.
///
/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", IoEvent::WRITE, libc::SO_SNDTIMEO, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

/// Hooked `send(2)`.
///
/// # Safety
///
/// `buf` must be valid for `len` readable bytes.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", IoEvent::WRITE, libc::SO_SNDTIMEO, || unsafe {
        libc::send(fd, buf, len, flags)
    })
}

/// Hooked `sendto(2)`.
///
/// # Safety
///
/// Pointer arguments as for the raw syscall.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", IoEvent::WRITE, libc::SO_SNDTIMEO, || unsafe {
        libc::sendto(fd, buf, len, flags, to, tolen)
    })
}

/// Hooked `sendmsg(2)`.
///
/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", IoEvent::WRITE, libc::SO_SNDTIMEO, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── fd control ────────────────────────────────────────────────────────

/// Hooked `fcntl(2)` (integer-argument commands).
///
/// `F_SETFL` records the application's `O_NONBLOCK` intent and keeps the
/// kernel flag forced on; `F_GETFL` masks the forced flag back out so the
/// application observes only its own intent. Everything else passes
/// through. Not gated on the hook flag: the nonblock bookkeeping must stay
/// consistent wherever the fd is touched.
///
/// # Safety
///
/// For pointer-argument commands, `arg` must be a valid pointer cast to
/// `c_long`, as with the raw variadic syscall.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: libc::c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg as c_int;
            match fd_table().get(fd, false) {
                Some(meta) if !meta.is_closed() && meta.is_socket() => {
                    meta.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    if meta.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                    libc::fcntl(fd, cmd, arg)
                }
                _ => libc::fcntl(fd, cmd, arg),
            }
        }
        libc::F_GETFL => {
            let flags = libc::fcntl(fd, cmd);
            match fd_table().get(fd, false) {
                Some(meta) if !meta.is_closed() && meta.is_socket() => {
                    if meta.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => libc::fcntl(fd, cmd, arg),
    }
}

/// Hooked `ioctl(2)`: `FIONBIO` is treated like the `F_SETFL` nonblock
/// update; everything else passes through.
///
/// # Safety
///
/// `arg` must be valid for the request, as for the raw syscall.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(meta) = fd_table().get(fd, false) {
            if !meta.is_closed() && meta.is_socket() {
                meta.set_user_nonblock(user_nonblock);
                // The kernel flag stays forced on; report success without
                // letting the raw call clear it.
                return 0;
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// Hooked `getsockopt(2)`: pure pass-through.
///
/// # Safety
///
/// Pointer arguments as for the raw syscall.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// Hooked `setsockopt(2)`: `SO_RCVTIMEO`/`SO_SNDTIMEO` are additionally
/// captured into the fd metadata, where the async-wrap reads them.
///
/// # Safety
///
/// `optval` must be valid for `optlen` bytes.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<timeval>()
    {
        if let Some(meta) = fd_table().get(fd, true) {
            let tv = &*(optval as *const timeval);
            let ms = tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000;
            meta.set_timeout_ms(optname, ms);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}
