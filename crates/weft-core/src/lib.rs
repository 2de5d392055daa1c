//! # weft-core
//!
//! Dependency-free leaf crate for the weft fiber runtime.
//!
//! This crate holds the small shared vocabulary the runtime is built from:
//! - [`FiberId`] — unique fiber identifiers
//! - [`FiberState`] — the fiber lifecycle state machine
//! - [`IoEvent`] — the read/write readiness bitset
//! - [`Error`] / [`Result`] — runtime error type
//! - [`env`] — environment variable parsing helpers

pub mod env;
pub mod error;
pub mod event;
pub mod id;
pub mod state;

pub use error::{Error, Result};
pub use event::IoEvent;
pub use id::FiberId;
pub use state::FiberState;
