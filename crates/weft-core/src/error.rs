//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that runtime operations can surface to callers.
///
/// Programming errors (resuming a terminated fiber, double-arming an event)
/// are not represented here; those are fatal assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The scheduler has fully stopped; no more work is accepted
    Stopped,

    /// Fiber stack allocation failed
    StackAlloc,

    /// A reactor registration call failed; carries the kernel errno
    Reactor(i32),

    /// Invalid configuration value
    InvalidConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Stopped => write!(f, "scheduler stopped"),
            Error::StackAlloc => write!(f, "fiber stack allocation failed"),
            Error::Reactor(errno) => write!(f, "reactor registration failed (errno {})", errno),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Error::Stopped), "scheduler stopped");
        assert_eq!(
            format!("{}", Error::Reactor(9)),
            "reactor registration failed (errno 9)"
        );
        assert_eq!(
            format!("{}", Error::InvalidConfig("stack too small")),
            "invalid config: stack too small"
        );
    }
}
