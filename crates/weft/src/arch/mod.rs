//! Architecture-specific context switching
//!
//! Each architecture module provides:
//! - a `Context` struct holding the callee-saved register frame of a
//!   suspended fiber,
//! - `init_context` to aim a fresh context at the entry trampoline,
//! - `context_switch` to save the current frame and resume another.
//!
//! Only callee-saved state is kept: switches are voluntary, so everything
//! else is dead at the switch point by the calling convention.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;
