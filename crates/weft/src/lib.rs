//! # weft
//!
//! A fiber runtime for Linux: application code is written in a plain
//! blocking style while the runtime multiplexes many stackful fibers onto a
//! small pool of OS threads, turning would-block syscalls into cooperative
//! yields parked on an epoll reactor and a timer set.
//!
//! # Architecture
//!
//! ```text
//!   hook        sleep / socket / connect / read / write / ...
//!     │         (blocking-style wrappers, per-thread enable flag)
//!     ▼
//!   fdtable     fd → {is-socket, nonblock intent, timeouts}
//!     │
//!     ▼
//!   iomanager   Scheduler<IoDriver>: epoll poller + timer set +
//!     │         self-pipe wakeups, unified idle loop
//!     ▼
//!   scheduler   worker threads × FIFO task queue (fibers or closures)
//!     │
//!     ▼
//!   fiber       stackful contexts, voluntary switch via arch asm
//! ```
//!
//! A fiber that would block in `read`/`accept`/`connect`/`sleep` instead
//! registers interest with the [`IoManager`] and yields. The idle fiber of
//! each worker blocks in `epoll_wait`; readiness or a timer deadline
//! re-schedules the parked fiber, the hooked call retries, and the caller
//! observes the same result the raw blocking syscall would have produced.
//!
//! # Example
//!
//! ```no_run
//! use weft::{IoManager, Task};
//!
//! let iom = IoManager::new(2, false, "example");
//! iom.schedule(Task::call(|| {
//!     // runs inside a fiber; hooked syscalls suspend instead of blocking
//!     weft::hook::sleep(1);
//! })).unwrap();
//! iom.stop();
//! ```

pub mod arch;
pub mod config;
pub mod fdtable;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("weft supports Linux on x86_64 and aarch64 only");
    }
}

pub use config::RuntimeConfig;
pub use fiber::{Fiber, Peer};
pub use hook::{is_hook_enabled, set_hook_enabled};
pub use iomanager::IoManager;
pub use scheduler::{NullDriver, Scheduler, Task};
pub use timer::{TimerHandle, TimerSet};
pub use weft_core::{Error, FiberId, FiberState, IoEvent, Result};
