use crate::error::Error;

/// Configuration for the io_uring service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of SQ entries — the maximum number of SQEs that can be
    /// queued without flushing to the kernel. The kernel rounds up to
    /// the next power of two.
    pub entries: u32,
    /// CQ size override. `None` leaves the kernel default (twice the
    /// SQ size). Raise this when many operations can complete between
    /// run-loop iterations.
    pub cq_entries: Option<u32>,
    /// Enable SQPOLL mode (kernel-side submission polling).
    pub sqpoll: bool,
    /// SQPOLL idle timeout in milliseconds.
    pub sqpoll_idle_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entries: 64,
            cq_entries: None,
            sqpoll: false,
            sqpoll_idle_ms: 1000,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is
    /// out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.entries == 0 {
            return Err(Error::RingSetup("entries must be > 0".into()));
        }
        if self.entries > 32768 {
            return Err(Error::RingSetup(
                "entries exceeds the kernel maximum of 32768".into(),
            ));
        }
        if let Some(cq) = self.cq_entries {
            if cq < self.entries {
                return Err(Error::RingSetup(
                    "cq_entries must be >= entries".into(),
                ));
            }
        }
        Ok(())
    }
}
