//! I/O readiness event bitset

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Bitset of I/O readiness events on a file descriptor.
///
/// The bit values match the kernel's (`EPOLLIN` = 0x1, `EPOLLOUT` = 0x4) so
/// conversion to and from the poller is a plain mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct IoEvent(u32);

impl IoEvent {
    /// No events.
    pub const NONE: IoEvent = IoEvent(0);
    /// Readable (EPOLLIN).
    pub const READ: IoEvent = IoEvent(0x1);
    /// Writable (EPOLLOUT).
    pub const WRITE: IoEvent = IoEvent(0x4);

    /// Construct from raw bits, keeping only the known event bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        IoEvent(bits & (Self::READ.0 | Self::WRITE.0))
    }

    /// Raw bit value.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: IoEvent) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` and `other` share any bit.
    #[inline]
    pub const fn intersects(self, other: IoEvent) -> bool {
        self.0 & other.0 != 0
    }

    /// The bits of `self` also present in `other`.
    #[inline]
    pub const fn intersection(self, other: IoEvent) -> IoEvent {
        IoEvent(self.0 & other.0)
    }

    /// `self` with the bits of `other` removed.
    #[inline]
    pub const fn without(self, other: IoEvent) -> IoEvent {
        IoEvent(self.0 & !other.0)
    }
}

impl BitOr for IoEvent {
    type Output = IoEvent;

    #[inline]
    fn bitor(self, rhs: IoEvent) -> IoEvent {
        IoEvent(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoEvent {
    #[inline]
    fn bitor_assign(&mut self, rhs: IoEvent) {
        self.0 |= rhs.0;
    }
}

impl Default for IoEvent {
    fn default() -> Self {
        IoEvent::NONE
    }
}

impl fmt::Debug for IoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in [(IoEvent::READ, "READ"), (IoEvent::WRITE, "WRITE")] {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for IoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        // Pinned to the kernel's EPOLLIN/EPOLLOUT values.
        assert_eq!(IoEvent::READ.bits(), 0x1);
        assert_eq!(IoEvent::WRITE.bits(), 0x4);
    }

    #[test]
    fn test_set_ops() {
        let both = IoEvent::READ | IoEvent::WRITE;
        assert!(both.contains(IoEvent::READ));
        assert!(both.contains(IoEvent::WRITE));
        assert_eq!(both.without(IoEvent::READ), IoEvent::WRITE);
        assert_eq!(both.intersection(IoEvent::READ), IoEvent::READ);
        assert!(IoEvent::READ.intersects(both));
        assert!(!IoEvent::READ.intersects(IoEvent::WRITE));
        assert!(IoEvent::NONE.is_empty());
    }

    #[test]
    fn test_from_bits_masks_unknown() {
        let ev = IoEvent::from_bits(0xFFFF_FFFF);
        assert_eq!(ev, IoEvent::READ | IoEvent::WRITE);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", IoEvent::NONE), "NONE");
        assert_eq!(format!("{}", IoEvent::READ), "READ");
        assert_eq!(format!("{}", IoEvent::READ | IoEvent::WRITE), "READ|WRITE");
    }
}
