//! Fiber lifecycle states

use core::fmt;

/// State of a fiber.
///
/// The lifecycle is: `Init` → `Exec` on first resume, then voluntary
/// transitions to `Hold`/`Ready` on yield, and finally `Term` on normal
/// return or `Except` when the entry closure panicked. A fiber in a
/// terminal state may only run again after `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Freshly created or reset, not yet entered
    Init = 0,

    /// Runnable, waiting in a scheduler queue
    Ready = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Suspended, owned by whoever will wake it (reactor, timer, app code)
    Hold = 3,

    /// Entry closure returned normally
    Term = 4,

    /// Entry closure panicked
    Except = 5,
}

impl FiberState {
    /// A fiber in one of these states may be resumed.
    #[inline]
    pub const fn is_resumable(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready | FiberState::Hold)
    }

    /// A fiber in one of these states has finished running its closure.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// A fiber in one of these states may have its entry closure reset.
    #[inline]
    pub const fn is_resettable(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => FiberState::Init,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(s: FiberState) -> u8 {
        s as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Exec => "EXEC",
            FiberState::Hold => "HOLD",
            FiberState::Term => "TERM",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable() {
        assert!(FiberState::Init.is_resumable());
        assert!(FiberState::Ready.is_resumable());
        assert!(FiberState::Hold.is_resumable());
        assert!(!FiberState::Exec.is_resumable());
        assert!(!FiberState::Term.is_resumable());
        assert!(!FiberState::Except.is_resumable());
    }

    #[test]
    fn test_terminal() {
        assert!(FiberState::Term.is_terminal());
        assert!(FiberState::Except.is_terminal());
        assert!(!FiberState::Hold.is_terminal());
    }

    #[test]
    fn test_resettable() {
        assert!(FiberState::Init.is_resettable());
        assert!(FiberState::Term.is_resettable());
        assert!(FiberState::Except.is_resettable());
        assert!(!FiberState::Exec.is_resettable());
        assert!(!FiberState::Ready.is_resettable());
    }

    #[test]
    fn test_u8_round_trip() {
        for s in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Exec,
            FiberState::Hold,
            FiberState::Term,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }
}
