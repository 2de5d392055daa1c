//! Hook-layer fd metadata
//!
//! A process-wide map from fd to [`FdMeta`], created lazily on the first
//! hooked observation of an fd. For sockets, creation forces kernel
//! nonblocking mode while remembering what the application asked for: the
//! hook layer emulates blocking semantics on top, so the kernel flag and
//! the user-visible flag intentionally diverge.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Per-fd metadata consulted by every hooked syscall.
pub struct FdMeta {
    fd: libc::c_int,
    is_socket: bool,
    /// Kernel O_NONBLOCK, forced on for sockets at registration.
    sys_nonblock: AtomicBool,
    /// What the application set via fcntl/ioctl.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    /// SO_RCVTIMEO in ms, -1 = infinite.
    recv_timeout_ms: AtomicI64,
    /// SO_SNDTIMEO in ms, -1 = infinite.
    send_timeout_ms: AtomicI64,
}

impl FdMeta {
    fn new(fd: libc::c_int) -> FdMeta {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        FdMeta {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
        }
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Timeout for `SO_RCVTIMEO` / `SO_SNDTIMEO`, in ms (-1 = infinite).
    pub fn timeout_ms(&self, kind: libc::c_int) -> i64 {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::Relaxed)
        } else {
            self.send_timeout_ms.load(Ordering::Relaxed)
        }
    }

    pub fn set_timeout_ms(&self, kind: libc::c_int, ms: i64) {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::Relaxed);
        } else {
            self.send_timeout_ms.store(ms, Ordering::Relaxed);
        }
    }
}

/// Process-wide fd → [`FdMeta`] table, grown lazily.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdMeta>>>>,
}

impl FdTable {
    fn new() -> FdTable {
        FdTable {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Metadata for `fd`. With `auto_create`, an entry is built on first
    /// observation (running `fstat` and forcing nonblock for sockets).
    pub fn get(&self, fd: libc::c_int, auto_create: bool) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(meta)) = slots.get(idx) {
                return Some(meta.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            slots.resize((idx + 1) * 3 / 2, None);
        }
        if let Some(meta) = &slots[idx] {
            return Some(meta.clone());
        }
        let meta = Arc::new(FdMeta::new(fd));
        slots[idx] = Some(meta.clone());
        Some(meta)
    }

    /// Forget `fd`; the next observation rebuilds it from scratch.
    pub fn del(&self, fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

/// The process-wide table.
pub fn fd_table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(FdTable::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_socket_fd() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let table = FdTable::new();
        assert!(table.get(fds[0], false).is_none());

        let meta = table.get(fds[0], true).unwrap();
        assert!(!meta.is_socket());
        assert!(!meta.sys_nonblock());

        // Pipes are left alone: no forced nonblock.
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_socket_forced_nonblock() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let table = FdTable::new();
        let meta = table.get(fd, true).unwrap();
        assert!(meta.is_socket());
        assert!(meta.sys_nonblock());
        assert!(!meta.user_nonblock());

        // The kernel flag really is set.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_timeouts_default_infinite() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);

        let table = FdTable::new();
        let meta = table.get(fd, true).unwrap();
        assert_eq!(meta.timeout_ms(libc::SO_RCVTIMEO), -1);
        assert_eq!(meta.timeout_ms(libc::SO_SNDTIMEO), -1);

        meta.set_timeout_ms(libc::SO_RCVTIMEO, 250);
        assert_eq!(meta.timeout_ms(libc::SO_RCVTIMEO), 250);
        assert_eq!(meta.timeout_ms(libc::SO_SNDTIMEO), -1);

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_del_forgets() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let table = FdTable::new();
        let first = table.get(fds[0], true).unwrap();
        table.del(fds[0]);
        assert!(table.get(fds[0], false).is_none());

        let second = table.get(fds[0], true).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let table = FdTable::new();
        // A large fd index forces a resize; fstat fails, entry still made.
        let meta = table.get(500, true).unwrap();
        assert!(!meta.is_socket());
    }
}
