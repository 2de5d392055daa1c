//! Edge-triggered epoll wrapper
//!
//! Thin shim over the kernel readiness facility. Registrations carry a
//! caller-chosen 64-bit word (the address of the owning fd context) so
//! event dispatch is O(1) with no lookup. Edge-triggered mode is
//! non-negotiable here: waiters drain with a single retry after wake, and
//! level-triggered wakes would re-fire for data nobody is waiting on.

use weft_core::{Error, IoEvent, Result};

/// Borrowed view of one ready entry from [`Poller::poll`].
#[derive(Clone, Copy)]
pub struct PolledEvent {
    /// Raw epoll readiness bits, error/hangup conditions included.
    pub bits: u32,
    /// The data word supplied at registration.
    pub data: u64,
}

impl From<&libc::epoll_event> for PolledEvent {
    fn from(ev: &libc::epoll_event) -> Self {
        PolledEvent {
            bits: ev.events,
            data: ev.u64,
        }
    }
}

impl PolledEvent {
    /// Readiness restricted to the READ/WRITE vocabulary.
    #[inline]
    pub fn events(&self) -> IoEvent {
        IoEvent::from_bits(self.bits)
    }

    /// Error or hangup condition on the fd.
    #[inline]
    pub fn has_error(&self) -> bool {
        self.bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0
    }
}

/// An empty event buffer for [`Poller::poll`].
pub fn event_buffer(len: usize) -> Vec<libc::epoll_event> {
    vec![libc::epoll_event { events: 0, u64: 0 }; len]
}

/// Owned epoll instance, used edge-triggered.
pub struct Poller {
    epfd: libc::c_int,
}

impl Poller {
    pub fn new() -> Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Reactor(errno()));
        }
        Ok(Poller { epfd })
    }

    /// Register `fd` for `events` (edge-triggered), tagging wakes with
    /// `data`.
    pub fn arm(&self, fd: libc::c_int, events: IoEvent, data: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, data)
    }

    /// Replace the armed event set of an already-registered fd.
    pub fn rearm(&self, fd: libc::c_int, events: IoEvent, data: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, data)
    }

    /// Remove a registration entirely.
    pub fn disarm(&self, fd: libc::c_int) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, IoEvent::NONE, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: libc::c_int, events: IoEvent, data: u64) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: events.bits() | libc::EPOLLET as u32,
            u64: data,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            let errno = errno();
            log::error!(
                "epoll_ctl(op={}, fd={}, events={}) failed: errno {}",
                op,
                fd,
                events,
                errno
            );
            return Err(Error::Reactor(errno));
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` for readiness, filling `out`. Returns the
    /// number of entries written. Interrupted waits are retried.
    pub fn poll(&self, timeout_ms: u64, out: &mut [libc::epoll_event]) -> Result<usize> {
        let max = out.len().min(i32::MAX as usize) as libc::c_int;
        let timeout = timeout_ms.min(i32::MAX as u64) as libc::c_int;
        loop {
            let n = unsafe { libc::epoll_wait(self.epfd, out.as_mut_ptr(), max, timeout) };
            if n >= 0 {
                return Ok(n as usize);
            }
            if errno() == libc::EINTR {
                continue;
            }
            return Err(Error::Reactor(errno()));
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_nonblock() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_arm_poll_disarm() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = pipe_nonblock();

        poller.arm(rd, IoEvent::READ, 0xDEAD).unwrap();

        // Nothing ready yet.
        let mut buf = event_buffer(8);
        assert_eq!(poller.poll(0, &mut buf).unwrap(), 0);

        // Write a byte; READ becomes ready with our tag.
        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr() as *const _, 1) }, 1);
        let n = poller.poll(1000, &mut buf).unwrap();
        assert_eq!(n, 1);
        let ev = PolledEvent::from(&buf[0]);
        assert_eq!(ev.data, 0xDEAD);
        assert!(ev.events().contains(IoEvent::READ));

        poller.disarm(rd).unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_double_arm_is_error() {
        let poller = Poller::new().unwrap();
        let (rd, _wr) = pipe_nonblock();
        poller.arm(rd, IoEvent::READ, 1).unwrap();
        let err = poller.arm(rd, IoEvent::READ, 1).unwrap_err();
        assert_eq!(err, Error::Reactor(libc::EEXIST));
        unsafe {
            libc::close(rd);
            libc::close(_wr);
        }
    }
}
