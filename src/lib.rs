//! ringway — single-threaded async I/O runtime built directly on
//! io_uring.
//!
//! One [`IoService`] owns one submission/completion queue pair. Every
//! exposed system call (file and socket I/O, timeouts, polling,
//! open/close) queues an SQE tagged with a fresh completion slot and
//! returns a future resolving to the kernel's signed result — negative
//! `-errno` on failure, the operation's value otherwise.
//! [`IoService::run`] drives a future to completion by flushing queued
//! entries, blocking for completions, and waking the tasks they
//! belong to. Everything happens on the calling thread; there is no
//! locking because there is no sharing.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! fn main() -> Result<(), ringway::Error> {
//!     let svc = ringway::IoService::new(64)?;
//!     let res = svc.run(async {
//!         // A kernel timer: resolves with -ETIME when it fires.
//!         svc.timeout(Duration::from_millis(10), 0).await
//!     })?;
//!     assert_eq!(res, -libc::ETIME);
//!     Ok(())
//! }
//! ```
//!
//! Concurrency comes from spawning: [`IoService::spawn`] places a task
//! on the service's executor and returns a [`JoinHandle`] the caller
//! can await. All tasks are polled by the one `run()` loop.
//!
//! # Platform
//!
//! Linux only. Operations missing on older kernels degrade: plain
//! read/write fall back to their single-iovec vectored forms,
//! recv/send to their msghdr forms, and openat/close to the
//! synchronous syscall after one NOP round-trip through the ring.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod completion;
pub(crate) mod executor;
pub(crate) mod op;
pub(crate) mod ring;
pub(crate) mod service;

// ── Public modules ──────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod metrics;

// ── Re-exports ──────────────────────────────────────────────────────

/// Service configuration.
pub use config::Config;
/// Service-level errors (setup, registration, run loop).
pub use error::Error;
/// Convert a kernel-style signed result into `io::Result`.
pub use error::io_result;
/// Handle to a spawned task.
pub use executor::JoinHandle;
/// An in-flight operation future.
pub use op::Op;
/// The I/O service: ring owner, operation surface, and run loop.
pub use service::IoService;

/// Per-op SQE flag bits (`IOSQE_*`), passed through each operation's
/// trailing `iflags` byte.
pub use io_uring::squeue::Flags as SqeFlags;
/// Flags for [`IoService::fsync`].
pub use io_uring::types::FsyncFlags;
/// Kernel timespec for [`IoService::timeout_ts`].
pub use io_uring::types::Timespec;
