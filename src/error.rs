use std::io;

use thiserror::Error;

/// Errors returned by the ringway service.
///
/// Per-operation outcomes are never routed through this type: an
/// operation future resolves to the kernel's signed result and the
/// caller decides what a negative value means. `Error` covers the
/// service itself — ring setup, registration, and the run loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Submitting to or waiting on the ring failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Ring setup failed (bad configuration or unsupported kernel).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// Fixed file or buffer registration failed.
    #[error("registration: {0}")]
    Registration(String),
    /// `run()` was called while this service was already driving a task.
    #[error("run loop already active on this service")]
    AlreadyRunning,
}

/// Convert a kernel-style signed result into an [`io::Result`].
///
/// Operations resolve with the raw convention of the ring: a
/// non-negative value is the success result (bytes transferred,
/// accepted fd, ...), a negative value is `-errno`. This helper is for
/// callers who prefer `std::io` errors; note that timeouts (`-ETIME`)
/// and cancellations (`-ECANCELED`) become errors like any other
/// negative result.
pub fn io_result(res: i32) -> io::Result<u32> {
    if res >= 0 {
        Ok(res as u32)
    } else {
        Err(io::Error::from_raw_os_error(-res))
    }
}
