//! Runtime configuration
//!
//! Compile-time defaults with environment overrides, published into live
//! atomics that the runtime reads on every use. Storing a new value takes
//! effect on the next fiber spawn / hooked connect, which is how live
//! reload reaches its subscribers.
//!
//! Environment variables:
//! - `WEFT_STACK_SIZE` — fiber stack size in bytes
//! - `WEFT_CONNECT_TIMEOUT_MS` — default timeout for hooked `connect`

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use weft_core::env::env_get;
use weft_core::{Error, Result};

/// Default fiber stack size: 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default hooked-connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: i64 = 5000;

/// Smallest accepted stack size. Below this the entry trampoline plus any
/// real closure would fault the guard page immediately.
const MIN_STACK_SIZE: usize = 16 * 1024;

static STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_STACK_SIZE);
static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(DEFAULT_CONNECT_TIMEOUT_MS);

/// Current fiber stack size in bytes.
#[inline]
pub fn stack_size() -> usize {
    STACK_SIZE.load(Ordering::Relaxed)
}

/// Update the fiber stack size. Applies to fibers spawned afterwards.
pub fn set_stack_size(bytes: usize) {
    let old = STACK_SIZE.swap(bytes, Ordering::Relaxed);
    if old != bytes {
        log::info!("fiber stack size changed from {} to {}", old, bytes);
    }
}

/// Current default timeout for hooked `connect`, in milliseconds.
/// -1 means no timeout.
#[inline]
pub fn connect_timeout_ms() -> i64 {
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

/// Update the default connect timeout. The hook layer reads the value on
/// every call, so the change is observed immediately.
pub fn set_connect_timeout_ms(ms: i64) {
    let old = CONNECT_TIMEOUT_MS.swap(ms, Ordering::Relaxed);
    if old != ms {
        log::info!("tcp connect timeout changed from {} to {}", old, ms);
    }
}

/// Runtime configuration with builder methods.
///
/// `from_env()` starts from the compile-time defaults and applies any
/// environment overrides; `install()` validates and publishes the values.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Fiber stack size in bytes
    pub stack_size: usize,
    /// Default hooked-connect timeout in milliseconds (-1 = none)
    pub connect_timeout_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE),
            connect_timeout_ms: env_get("WEFT_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: i64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidConfig("stack_size must be >= 16 KiB"));
        }
        if self.connect_timeout_ms < -1 {
            return Err(Error::InvalidConfig("connect_timeout_ms must be >= -1"));
        }
        Ok(())
    }

    /// Validate and publish into the live atomics.
    pub fn install(&self) -> Result<()> {
        self.validate()?;
        set_stack_size(self.stack_size);
        set_connect_timeout_ms(self.connect_timeout_ms);
        Ok(())
    }
}
